//! Remote filesystem trait

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use super::link::BoxedStream;
use crate::error::SftpError;
use tl_protocol::FileRecord;

/// Readable remote file
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable remote file
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Attributes of one remote path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteStat {
    pub is_dir: bool,
    /// Set only by [`RemoteFs::lstat`]
    pub is_link: bool,
    pub size: u64,
    pub mode: Option<u32>,
}

/// File operations over an SFTP channel
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// List a directory (without `.` and `..`)
    async fn read_dir(&self, path: &str) -> Result<Vec<FileRecord>, SftpError>;

    /// Attributes of a path, following symlinks
    async fn stat(&self, path: &str) -> Result<RemoteStat, SftpError>;

    /// Attributes of a path itself; a symlink is reported as a link and
    /// never as its target
    async fn lstat(&self, path: &str) -> Result<RemoteStat, SftpError>;

    /// Open a file for reading
    async fn open_read(&self, path: &str) -> Result<RemoteReader, SftpError>;

    /// Create or truncate a file for writing
    async fn create(&self, path: &str) -> Result<RemoteWriter, SftpError>;

    /// Create a directory
    async fn mkdir(&self, path: &str) -> Result<(), SftpError>;

    /// Rename or move a path
    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError>;

    /// Remove a file
    async fn remove_file(&self, path: &str) -> Result<(), SftpError>;

    /// Remove an empty directory
    async fn remove_dir(&self, path: &str) -> Result<(), SftpError>;

    /// Set permission bits
    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), SftpError>;

    /// Close the SFTP channel
    async fn close(&self) -> Result<(), SftpError>;
}

/// Starts an SFTP client over an opened subsystem stream
#[async_trait]
pub trait RemoteFsFactory: Send + Sync {
    /// Run the SFTP handshake and return the client
    async fn open(&self, stream: BoxedStream) -> Result<Arc<dyn RemoteFs>, SftpError>;
}
