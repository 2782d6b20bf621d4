//! Receiving end of a transfer (`scp -t`).

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use filetime::FileTime;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::*;

use super::types::{ScpError, ScpMessage, ScpOptions, ACK_FATAL, ACK_OK, ACK_WARNING};
use super::{parse_message, resolve_path};

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Drives the sink side of the protocol: acknowledge, read control lines,
/// write the received files under the resolved target.
pub struct ScpSink<R, W> {
    reader: BufReader<R>,
    writer: W,
    options: ScpOptions,
    root: PathBuf,
    /// Directory context built up by `D`/`E` messages.
    dirs: Vec<PathBuf>,
    pending_times: Option<(FileTime, FileTime)>,
    target: PathBuf,
    target_is_dir: bool,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> ScpSink<R, W> {
    pub fn new(reader: R, writer: W, options: ScpOptions, root: PathBuf) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            options,
            root,
            dirs: Vec::new(),
            pending_times: None,
            target: PathBuf::new(),
            target_is_dir: false,
        }
    }

    pub async fn run(&mut self) -> Result<u32, ScpError> {
        match self.process().await {
            Ok(()) => Ok(0),
            Err(error) => {
                if !matches!(error, ScpError::Remote(_)) {
                    let _ = self.send_fatal(&format!("scp: {error}")).await;
                }
                Err(error)
            }
        }
    }

    async fn process(&mut self) -> Result<(), ScpError> {
        let [target] = &self.options.file_names[..] else {
            return Err(ScpError::AmbiguousTarget);
        };
        self.target = resolve_path(&self.root, target)?;
        self.target_is_dir = tokio::fs::metadata(&self.target)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if self.options.target_is_dir && !self.target_is_dir {
            return Err(ScpError::Protocol(format!(
                "target {target:?} is not a directory"
            )));
        }

        self.send_ack().await?;

        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                if !self.dirs.is_empty() {
                    return Err(ScpError::Protocol(
                        "stream ended inside a directory".to_owned(),
                    ));
                }
                return Ok(());
            }
            match parse_message(&line)? {
                ScpMessage::Times {
                    mtime,
                    mtime_us,
                    atime,
                    atime_us,
                } => {
                    // Only meaningful under -p; acknowledged either way
                    if self.options.preserve {
                        self.pending_times = Some((
                            FileTime::from_unix_time(atime, (atime_us * 1000) as u32),
                            FileTime::from_unix_time(mtime, (mtime_us * 1000) as u32),
                        ));
                    }
                    self.send_ack().await?;
                }
                ScpMessage::FileHeader { mode, size, name } => {
                    self.receive_file(mode, size, &name).await?;
                }
                ScpMessage::DirHeader { mode, name } => {
                    if !self.options.recursive {
                        return Err(ScpError::Protocol(
                            "received a directory in a non-recursive transfer".to_owned(),
                        ));
                    }
                    self.enter_dir(mode, &name).await?;
                    self.send_ack().await?;
                }
                ScpMessage::EndDir => {
                    if self.dirs.pop().is_none() {
                        return Err(ScpError::Protocol(
                            "end-of-directory without a matching directory".to_owned(),
                        ));
                    }
                    self.send_ack().await?;
                }
            }
        }
    }

    /// Where the next entry named `name` lands, given the current directory
    /// context. The name must be a single path component.
    fn dest_for(&self, name: &str) -> Result<PathBuf, ScpError> {
        if name.is_empty() || name == ".." || name.contains('/') {
            return Err(ScpError::Protocol(format!("unacceptable name {name:?}")));
        }
        if let Some(dir) = self.dirs.last() {
            return Ok(dir.join(name));
        }
        if self.target_is_dir {
            Ok(self.target.join(name))
        } else {
            Ok(self.target.clone())
        }
    }

    async fn enter_dir(&mut self, mode: u32, name: &str) -> Result<(), ScpError> {
        let path = self.dest_for(name)?;
        debug!(?path, "Creating directory");
        match tokio::fs::create_dir(&path).await {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if !tokio::fs::metadata(&path).await?.is_dir() {
                    return Err(ScpError::Protocol(format!(
                        "{name:?} exists and is not a directory"
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }
        if self.options.preserve {
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777))
                .await?;
        }
        if let Some((atime, mtime)) = self.pending_times.take() {
            filetime::set_file_times(&path, atime, mtime)?;
        }
        self.dirs.push(path);
        Ok(())
    }

    async fn receive_file(&mut self, mode: u32, size: u64, name: &str) -> Result<(), ScpError> {
        let path = self.dest_for(name)?;
        debug!(?path, size, "Receiving file");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        self.send_ack().await?;

        let mut remaining = size;
        let mut buf = [0; COPY_BUF_SIZE];
        while remaining > 0 {
            let chunk = buf.len().min(remaining as usize);
            let n = self.reader.read(&mut buf[..chunk]).await?;
            if n == 0 {
                return Err(ScpError::Protocol(format!(
                    "stream ended mid-file with {remaining} bytes missing"
                )));
            }
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        file.flush().await?;
        drop(file);

        if self.options.preserve {
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777))
                .await?;
        }
        if let Some((atime, mtime)) = self.pending_times.take() {
            filetime::set_file_times(&path, atime, mtime)?;
        }

        // The sender confirms the body with its own status byte.
        match self.reader.read_u8().await? {
            ACK_OK => (),
            ACK_WARNING => {
                let mut message = String::new();
                self.reader.read_line(&mut message).await?;
                warn!(message = message.trim_end(), "Sender reported a warning");
            }
            _ => {
                let mut message = String::new();
                self.reader.read_line(&mut message).await?;
                return Err(ScpError::Remote(message.trim_end().to_owned()));
            }
        }
        self.send_ack().await?;
        Ok(())
    }

    async fn send_ack(&mut self) -> Result<(), ScpError> {
        self.writer.write_all(&[ACK_OK]).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_fatal(&mut self, message: &str) -> Result<(), ScpError> {
        self.writer.write_all(&[ACK_FATAL]).await?;
        self.writer.write_all(message.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}
