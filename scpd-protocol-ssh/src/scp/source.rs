//! Sending end of a transfer (`scp -f`).

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use filetime::FileTime;
use tokio::fs::{File, ReadDir};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::*;

use super::types::{ScpError, ScpMessage, ScpOptions, ACK_FATAL, ACK_OK, ACK_WARNING};
use super::resolve_path;

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Drives the source side of the protocol: walk the requested paths and
/// stream them out, pausing for the receiver's acknowledgement after every
/// control line and file body.
pub struct ScpSource<R, W> {
    reader: BufReader<R>,
    writer: W,
    options: ScpOptions,
    root: PathBuf,
    exit_code: u32,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> ScpSource<R, W> {
    pub fn new(reader: R, writer: W, options: ScpOptions, root: PathBuf) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            options,
            root,
            exit_code: 0,
        }
    }

    pub async fn run(&mut self) -> Result<u32, ScpError> {
        match self.process().await {
            Ok(()) => Ok(self.exit_code),
            Err(error) => {
                if !matches!(error, ScpError::Remote(_)) {
                    let _ = self.send_diagnostic(ACK_FATAL, &format!("scp: {error}")).await;
                }
                Err(error)
            }
        }
    }

    async fn process(&mut self) -> Result<(), ScpError> {
        // The receiver opens the exchange with its first acknowledgement.
        self.read_ack().await?;

        if self.options.file_names.is_empty() {
            return Err(ScpError::Protocol("no files requested".to_owned()));
        }

        for requested in self.options.file_names.clone() {
            let path = match resolve_path(&self.root, &requested) {
                Ok(path) => path,
                Err(error) => {
                    self.send_warning(&requested, &error.to_string()).await?;
                    continue;
                }
            };
            // Follows symlinks, unlike the metadata of a directory entry
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(error) => {
                    self.send_warning(&requested, &error.to_string()).await?;
                    continue;
                }
            };
            let name = entry_name(&path);
            if metadata.is_dir() {
                if self.options.recursive {
                    self.send_dir(&path, &name, &metadata).await?;
                } else {
                    self.send_warning(&requested, "not a regular file").await?;
                }
            } else if metadata.is_file() {
                self.send_file(&path, &name, &metadata).await?;
            } else {
                self.send_warning(&requested, "not a regular file").await?;
            }
        }
        Ok(())
    }

    async fn send_file(
        &mut self,
        path: &Path,
        name: &str,
        metadata: &std::fs::Metadata,
    ) -> Result<(), ScpError> {
        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(error) => {
                return self.send_warning(name, &error.to_string()).await;
            }
        };
        debug!(?path, "Sending file");

        if self.options.preserve {
            self.send_times(metadata).await?;
        }

        let size = metadata.len();
        let header = ScpMessage::FileHeader {
            mode: metadata.permissions().mode() & 0o7777,
            size,
            name: name.to_owned(),
        };
        self.send_message(&header).await?;
        self.read_ack().await?;

        let mut remaining = size;
        let mut buf = [0; COPY_BUF_SIZE];
        while remaining > 0 {
            let chunk = buf.len().min(remaining as usize);
            let n = file.read(&mut buf[..chunk]).await?;
            if n == 0 {
                break;
            }
            self.writer.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        // If the file shrank mid-transfer the advertised size still has to
        // be honored, so the difference goes out as zeros.
        if remaining > 0 {
            warn!(?path, remaining, "File shrank during transfer, padding");
            let zeros = [0; COPY_BUF_SIZE];
            while remaining > 0 {
                let chunk = zeros.len().min(remaining as usize);
                self.writer.write_all(&zeros[..chunk]).await?;
                remaining -= chunk as u64;
            }
        }

        self.writer.write_all(&[ACK_OK]).await?;
        self.writer.flush().await?;
        self.read_ack().await?;
        Ok(())
    }

    async fn send_dir(
        &mut self,
        path: &Path,
        name: &str,
        metadata: &std::fs::Metadata,
    ) -> Result<(), ScpError> {
        debug!(?path, "Sending directory");
        // Opened before its header goes out; a failed open stays a
        // per-entry warning rather than a mid-walk abort.
        let dir = match tokio::fs::read_dir(path).await {
            Ok(dir) => dir,
            Err(error) => {
                return self.send_warning(name, &error.to_string()).await;
            }
        };
        if self.options.preserve {
            self.send_times(metadata).await?;
        }
        self.send_message(&ScpMessage::DirHeader {
            mode: metadata.permissions().mode() & 0o7777,
            name: name.to_owned(),
        })
        .await?;
        self.read_ack().await?;

        // Explicit stack instead of recursion, one open handle per level
        let mut stack: Vec<ReadDir> = vec![dir];
        while let Some(current) = stack.last_mut() {
            let Some(entry) = current.next_entry().await? else {
                stack.pop();
                self.send_message(&ScpMessage::EndDir).await?;
                self.read_ack().await?;
                continue;
            };
            let entry_path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = match tokio::fs::metadata(&entry_path).await {
                Ok(metadata) => metadata,
                Err(error) => {
                    self.send_warning(&name, &error.to_string()).await?;
                    continue;
                }
            };
            if metadata.is_dir() {
                let subdir = match tokio::fs::read_dir(&entry_path).await {
                    Ok(subdir) => subdir,
                    Err(error) => {
                        self.send_warning(&name, &error.to_string()).await?;
                        continue;
                    }
                };
                if self.options.preserve {
                    self.send_times(&metadata).await?;
                }
                self.send_message(&ScpMessage::DirHeader {
                    mode: metadata.permissions().mode() & 0o7777,
                    name,
                })
                .await?;
                self.read_ack().await?;
                stack.push(subdir);
            } else if metadata.is_file() {
                self.send_file(&entry_path, &name, &metadata).await?;
            } else {
                self.send_warning(&name, "not a regular file").await?;
            }
        }
        Ok(())
    }

    async fn send_times(&mut self, metadata: &std::fs::Metadata) -> Result<(), ScpError> {
        let mtime = FileTime::from_last_modification_time(metadata);
        let atime = metadata
            .accessed()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| FileTime::from_unix_time(d.as_secs() as i64, d.subsec_nanos()))
            .unwrap_or(mtime);
        self.send_message(&ScpMessage::Times {
            mtime: mtime.unix_seconds(),
            mtime_us: (mtime.nanoseconds() / 1000) as i64,
            atime: atime.unix_seconds(),
            atime_us: (atime.nanoseconds() / 1000) as i64,
        })
        .await?;
        self.read_ack().await?;
        Ok(())
    }

    async fn send_message(&mut self, message: &ScpMessage) -> Result<(), ScpError> {
        self.writer.write_all(message.to_wire().as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_warning(&mut self, name: &str, reason: &str) -> Result<(), ScpError> {
        warn!(name, reason, "Skipping entry");
        self.send_diagnostic(ACK_WARNING, &format!("scp: {name}: {reason}"))
            .await?;
        self.exit_code = 1;
        Ok(())
    }

    async fn send_diagnostic(&mut self, level: u8, message: &str) -> Result<(), ScpError> {
        self.writer.write_all(&[level]).await?;
        self.writer.write_all(message.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_ack(&mut self) -> Result<(), ScpError> {
        match self.reader.read_u8().await? {
            ACK_OK => Ok(()),
            ACK_WARNING => {
                let mut message = String::new();
                self.reader.read_line(&mut message).await?;
                warn!(message = message.trim_end(), "Receiver reported a warning");
                self.exit_code = 1;
                Ok(())
            }
            ACK_FATAL => {
                let mut message = String::new();
                self.reader.read_line(&mut message).await?;
                Err(ScpError::Remote(message.trim_end().to_owned()))
            }
            other => Err(ScpError::Protocol(format!(
                "unexpected acknowledgement byte {other}"
            ))),
        }
    }
}

/// Last path component sent to the receiver as the entry name.
fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scp::ScpSink;

    fn source_options(names: &[&str], recursive: bool, preserve: bool) -> ScpOptions {
        ScpOptions {
            from: true,
            recursive,
            preserve,
            file_names: names.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    async fn run_source(
        acks: &[u8],
        options: ScpOptions,
        root: PathBuf,
    ) -> (Result<u32, ScpError>, Vec<u8>) {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let (client_read, mut client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);

        client_write.write_all(acks).await.unwrap();

        let mut source = ScpSource::new(server_read, server_write, options, root);
        let result = source.run().await;
        drop(source);

        let mut sent = Vec::new();
        let mut client_read = client_read;
        client_read.read_to_end(&mut sent).await.unwrap();
        (result, sent)
    }

    #[tokio::test]
    async fn test_send_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let (result, sent) = run_source(
            &[0; 8],
            source_options(&["hello.txt"], false, false),
            dir.path().to_path_buf(),
        )
        .await;
        assert_eq!(result.unwrap(), 0);
        assert_eq!(sent, b"C0644 5 hello.txt\nhello\0");
    }

    #[tokio::test]
    async fn test_send_with_times() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        std::fs::write(&path, b"x").unwrap();
        filetime::set_file_times(
            &path,
            FileTime::from_unix_time(1700000100, 0),
            FileTime::from_unix_time(1700000000, 0),
        )
        .unwrap();

        let (result, sent) = run_source(
            &[0; 8],
            source_options(&["t.txt"], false, true),
            dir.path().to_path_buf(),
        )
        .await;
        assert_eq!(result.unwrap(), 0);
        assert!(sent.starts_with(b"T1700000000 0 1700000100 0\n"));
    }

    #[tokio::test]
    async fn test_missing_file_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let (result, sent) = run_source(
            &[0; 8],
            source_options(&["nope.txt"], false, false),
            dir.path().to_path_buf(),
        )
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(sent[0], ACK_WARNING);
        assert!(sent.ends_with(b"\n"));
    }

    #[tokio::test]
    async fn test_directory_without_recursive_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let (result, sent) = run_source(
            &[0; 8],
            source_options(&["sub"], false, false),
            dir.path().to_path_buf(),
        )
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(sent[0], ACK_WARNING);
        let message = String::from_utf8_lossy(&sent[1..]).into_owned();
        assert!(message.contains("not a regular file"));
    }

    #[tokio::test]
    async fn test_send_recursive_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::set_permissions(
            dir.path().join("sub"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        let path = dir.path().join("sub/a.txt");
        std::fs::write(&path, b"abc").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let (result, sent) = run_source(
            &[0; 16],
            source_options(&["sub"], true, false),
            dir.path().to_path_buf(),
        )
        .await;
        assert_eq!(result.unwrap(), 0);
        assert_eq!(sent, b"D0755 0 sub\nC0644 3 a.txt\nabc\0E\n");
    }

    #[tokio::test]
    async fn test_unreadable_directory_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        let path = dir.path().join("ok.txt");
        std::fs::write(&path, b"fine").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        if std::fs::read_dir(&locked).is_ok() {
            // Privileged runs can open it anyway, nothing to observe then
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let (result, sent) = run_source(
            &[0; 16],
            source_options(&["locked", "ok.txt"], true, false),
            dir.path().to_path_buf(),
        )
        .await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(result.unwrap(), 1);
        // The unopenable directory is reported, its sibling still transfers
        assert_eq!(sent[0], ACK_WARNING);
        let output = String::from_utf8_lossy(&sent).into_owned();
        assert!(!output.contains("D0"));
        assert!(output.contains("C0644 4 ok.txt\nfine\0"));
    }

    #[tokio::test]
    async fn test_remote_fatal_aborts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), b"x").unwrap();

        let (result, _) = run_source(
            b"\0\x02out of space\n",
            source_options(&["f.txt"], false, false),
            dir.path().to_path_buf(),
        )
        .await;
        match result {
            Err(ScpError::Remote(message)) => assert_eq!(message, "out of space"),
            other => panic!("expected a remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_sink() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("tree")).unwrap();
        std::fs::write(src.path().join("tree/a.txt"), b"alpha").unwrap();
        std::fs::create_dir(src.path().join("tree/nested")).unwrap();
        std::fs::write(src.path().join("tree/nested/b.txt"), b"beta").unwrap();
        let dst = tempfile::tempdir().unwrap();

        let (a, b) = tokio::io::duplex(1024 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let mut source = ScpSource::new(
            a_read,
            a_write,
            source_options(&["tree"], true, false),
            src.path().to_path_buf(),
        );
        let mut sink = ScpSink::new(
            b_read,
            b_write,
            ScpOptions {
                to: true,
                recursive: true,
                target_is_dir: true,
                file_names: vec!["/".to_owned()],
                ..Default::default()
            },
            dst.path().to_path_buf(),
        );

        let (source_result, sink_result) = tokio::join!(
            async {
                let result = source.run().await;
                drop(source);
                result
            },
            sink.run(),
        );
        assert_eq!(source_result.unwrap(), 0);
        assert_eq!(sink_result.unwrap(), 0);

        assert_eq!(
            std::fs::read(dst.path().join("tree/a.txt")).unwrap(),
            b"alpha"
        );
        assert_eq!(
            std::fs::read(dst.path().join("tree/nested/b.txt")).unwrap(),
            b"beta"
        );
    }
}
