//! SFTP payload types

use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, TaskKey};

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Entry name (no directory part)
    pub name: String,
    /// Full remote path
    pub path: String,
    /// Whether the entry is a directory
    pub is_dir: bool,
    /// Permission bits, if reported by the server
    pub mode: Option<u32>,
    /// Whether the entry is a symbolic link
    pub is_link: bool,
    /// Modification time in seconds since the epoch
    pub mod_time: Option<u64>,
    /// Size in bytes
    pub size: u64,
}

/// Direction of a file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Upload,
    Download,
}

/// Progress of one file transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// Session the transfer runs on
    pub session_id: SessionId,
    /// Transfer task key
    pub task_key: TaskKey,
    /// Remote path being written or read
    pub remote_path: String,
    /// Bytes transferred so far (monotonic)
    pub bytes: u64,
    /// Total bytes expected
    pub total: u64,
    /// Upload or download
    pub direction: TransferKind,
}
