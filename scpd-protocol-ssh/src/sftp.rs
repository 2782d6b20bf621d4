//! SFTP subsystem backed by the served root.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use russh::server::{Handle, Msg};
use russh::Channel;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle as SftpHandle, Name, OpenFlags, Status, StatusCode,
    Version,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::*;

/// Runs the SFTP server over the channel until the client disconnects,
/// then reports a clean exit on the channel.
pub async fn handle_sftp(channel: Channel<Msg>, handle: Handle, root: PathBuf) {
    let channel_id = channel.id();
    debug!("Starting SFTP subsystem");
    russh_sftp::server::run(channel.into_stream(), SftpSession::new(root)).await;
    debug!("SFTP subsystem finished");
    let _ = handle.exit_status_request(channel_id, 0).await;
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
}

struct SftpSession {
    root: PathBuf,
    next_handle: u64,
    files: HashMap<String, tokio::fs::File>,
    dirs: HashMap<String, Vec<File>>,
}

impl SftpSession {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            next_handle: 0,
            files: HashMap::new(),
            dirs: HashMap::new(),
        }
    }

    fn allocate_handle(&mut self) -> String {
        self.next_handle += 1;
        format!("handle-{}", self.next_handle)
    }

    fn resolve(&self, requested: &str) -> Result<PathBuf, StatusCode> {
        let mut resolved = self.root.clone();
        for component in Path::new(requested).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => (),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(StatusCode::PermissionDenied)
                }
            }
        }
        Ok(resolved)
    }
}

fn status_ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_owned(),
        language_tag: "en-US".to_owned(),
    }
}

fn map_io_error(error: std::io::Error) -> StatusCode {
    match error.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

/// The client-visible absolute form of a path, with `.` and `..` folded.
fn virtual_path(requested: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(requested).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().unwrap_or_default()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => (),
        }
    }
    format!("/{}", parts.join("/"))
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(version, ?extensions, "SFTP init");
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<SftpHandle, Self::Error> {
        let path = self.resolve(&filename)?;
        debug!(?path, ?pflags, "SFTP open");
        let file = tokio::fs::OpenOptions::new()
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE))
            .append(pflags.contains(OpenFlags::APPEND))
            .create(pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE))
            .create_new(pflags.contains(OpenFlags::EXCLUDE))
            .open(&path)
            .await
            .map_err(map_io_error)?;
        let handle = self.allocate_handle();
        self.files.insert(handle.clone(), file);
        Ok(SftpHandle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        if let Some(mut file) = self.files.remove(&handle) {
            file.flush().await.map_err(map_io_error)?;
        }
        self.dirs.remove(&handle);
        Ok(status_ok(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.files.get_mut(&handle).ok_or(StatusCode::Failure)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(map_io_error)?;
        let mut data = vec![0; len as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = file.read(&mut data[filled..]).await.map_err(map_io_error)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 && len > 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(filled);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.files.get_mut(&handle).ok_or(StatusCode::Failure)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(map_io_error)?;
        file.write_all(&data).await.map_err(map_io_error)?;
        Ok(status_ok(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let path = self.resolve(&path)?;
        let metadata = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(map_io_error)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let path = self.resolve(&path)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(map_io_error)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<SftpHandle, Self::Error> {
        let resolved = self.resolve(&path)?;
        debug!(?resolved, "SFTP opendir");
        let mut dir = tokio::fs::read_dir(&resolved).await.map_err(map_io_error)?;
        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(map_io_error)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let attrs = match entry.metadata().await {
                Ok(metadata) => FileAttributes::from(&metadata),
                Err(_) => FileAttributes::default(),
            };
            files.push(File::new(name, attrs));
        }
        let handle = self.allocate_handle();
        self.dirs.insert(handle.clone(), files);
        Ok(SftpHandle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let entries = self.dirs.get_mut(&handle).ok_or(StatusCode::Failure)?;
        if entries.is_empty() {
            return Err(StatusCode::Eof);
        }
        Ok(Name {
            id,
            files: std::mem::take(entries),
        })
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        Ok(Name {
            id,
            files: vec![File::dummy(virtual_path(&path))],
        })
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let path = self.resolve(&path)?;
        tokio::fs::create_dir(&path).await.map_err(map_io_error)?;
        Ok(status_ok(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        let path = self.resolve(&filename)?;
        tokio::fs::remove_file(&path).await.map_err(map_io_error)?;
        Ok(status_ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        let path = self.resolve(&path)?;
        tokio::fs::remove_dir(&path).await.map_err(map_io_error)?;
        Ok(status_ok(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        let from = self.resolve(&oldpath)?;
        let to = self.resolve(&newpath)?;
        tokio::fs::rename(&from, &to).await.map_err(map_io_error)?;
        Ok(status_ok(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_path() {
        assert_eq!(virtual_path("/"), "/");
        assert_eq!(virtual_path("."), "/");
        assert_eq!(virtual_path("/a/b"), "/a/b");
        assert_eq!(virtual_path("/a/./b"), "/a/b");
        assert_eq!(virtual_path("/a/../b"), "/b");
        assert_eq!(virtual_path("/../.."), "/");
    }

    #[test]
    fn test_resolve_stays_under_root() {
        let session = SftpSession::new(PathBuf::from("/srv"));
        assert_eq!(
            session.resolve("/a/b").unwrap(),
            PathBuf::from("/srv/a/b")
        );
        assert!(session.resolve("/a/../../b").is_err());
    }
}
