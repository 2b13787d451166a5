//! russh-sftp backend

use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpClientError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use std::sync::Arc;

use tl_core::error::SftpError;
use tl_core::traits::{BoxedStream, RemoteFs, RemoteFsFactory, RemoteReader, RemoteStat, RemoteWriter};
use tl_protocol::FileRecord;

/// Opens [`RusshFs`] clients over `sftp` subsystem streams
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshFsFactory;

#[async_trait]
impl RemoteFsFactory for RusshFsFactory {
    async fn open(&self, stream: BoxedStream) -> Result<Arc<dyn RemoteFs>, SftpError> {
        let session = SftpSession::new(stream).await.map_err(map_error)?;
        Ok(Arc::new(RusshFs { session }))
    }
}

/// SFTP client on one subsystem channel
pub struct RusshFs {
    session: SftpSession,
}

#[async_trait]
impl RemoteFs for RusshFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<FileRecord>, SftpError> {
        let entries = self.session.read_dir(path).await.map_err(map_error)?;
        let base = path.trim_end_matches('/');

        let mut records = Vec::new();
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let meta = entry.metadata();
            let file_type = entry.file_type();
            records.push(FileRecord {
                path: format!("{}/{}", base, name),
                name,
                is_dir: file_type.is_dir(),
                mode: meta.permissions,
                is_link: file_type.is_symlink(),
                mod_time: meta.mtime.map(u64::from),
                size: meta.size.unwrap_or(0),
            });
        }
        Ok(records)
    }

    async fn stat(&self, path: &str) -> Result<RemoteStat, SftpError> {
        let meta = self.session.metadata(path).await.map_err(map_error)?;
        Ok(RemoteStat {
            is_dir: meta.is_dir(),
            is_link: false,
            size: meta.size.unwrap_or(0),
            mode: meta.permissions,
        })
    }

    async fn lstat(&self, path: &str) -> Result<RemoteStat, SftpError> {
        let meta = self.session.symlink_metadata(path).await.map_err(map_error)?;
        let is_link = meta.is_symlink();
        Ok(RemoteStat {
            is_dir: meta.is_dir() && !is_link,
            is_link,
            size: meta.size.unwrap_or(0),
            mode: meta.permissions,
        })
    }

    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        let file = self.session.open(path).await.map_err(map_error)?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        let file = self.session.create(path).await.map_err(map_error)?;
        Ok(Box::new(file))
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.session.create_dir(path).await.map_err(map_error)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.session.rename(from, to).await.map_err(map_error)
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        self.session.remove_file(path).await.map_err(map_error)
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        self.session.remove_dir(path).await.map_err(map_error)
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..FileAttributes::empty()
        };
        self.session
            .set_metadata(path, attrs)
            .await
            .map_err(map_error)
    }

    async fn close(&self) -> Result<(), SftpError> {
        self.session.close().await.map_err(map_error)
    }
}

/// Keep the server's message as-is
fn map_error(e: SftpClientError) -> SftpError {
    match e {
        SftpClientError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => SftpError::PathNotFound(status.error_message),
            StatusCode::PermissionDenied => SftpError::PermissionDenied(status.error_message),
            _ => SftpError::Remote(status.error_message),
        },
        other => SftpError::Remote(other.to_string()),
    }
}
