//! SFTP subsystem
//!
//! One [`SftpChannel`] per session, opened on first use and reused. A failed
//! operation reports the server's message and leaves the channel usable.

mod client;
mod transfer;

pub use client::{RusshFs, RusshFsFactory};
pub use transfer::{ProgressThrottle, TaskGuard, TaskRegistry, TransferTask};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tl_core::config::CoreConfig;
use tl_core::error::SftpError;
use tl_core::traits::RemoteFs;
use tl_protocol::{FileRecord, SessionId, TaskKey, TransferKind, TransferOutcome};

use crate::events::EventBus;
use crate::transport::ChannelSlot;
use transfer::{copy_chunks, ProgressReporter};

/// The SFTP channel of one session
pub struct SftpChannel {
    session_id: SessionId,
    fs: Arc<dyn RemoteFs>,
    events: EventBus,
    tasks: Arc<TaskRegistry>,
    chunk_size: usize,
    progress_interval: Duration,
    _slot: Option<ChannelSlot>,
}

impl SftpChannel {
    /// Wrap an opened SFTP client
    pub fn new(
        session_id: SessionId,
        fs: Arc<dyn RemoteFs>,
        slot: Option<ChannelSlot>,
        events: EventBus,
        tasks: Arc<TaskRegistry>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            session_id,
            fs,
            events,
            tasks,
            chunk_size: config.transfer_chunk_size,
            progress_interval: config.progress_interval,
            _slot: slot,
        }
    }

    /// List a remote directory
    pub async fn list(&self, path: &str) -> Result<Vec<FileRecord>, SftpError> {
        tracing::debug!("[{}] list {}", self.session_id, path);
        self.fs.read_dir(path).await
    }

    /// Upload one local file
    pub async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        task_key: TaskKey,
    ) -> Result<TransferOutcome, SftpError> {
        let task = self.tasks.begin(task_key)?;
        let total = tokio::fs::metadata(local_path).await?.len();
        let mut reporter = self.reporter(&task, TransferKind::Upload, total);

        tracing::info!(
            "[{}] upload {} -> {} ({} bytes)",
            self.session_id,
            local_path.display(),
            remote_path,
            total
        );

        let result = async {
            let mut reader = tokio::fs::File::open(local_path).await?;
            let mut writer = self.fs.create(remote_path).await?;
            let mut transferred = 0;
            copy_chunks(
                &mut reader,
                &mut writer,
                self.chunk_size,
                remote_path,
                &mut transferred,
                &mut reporter,
            )
            .await
        }
        .await;

        self.conclude(&task, &reporter, result)
    }

    /// Upload a local directory tree, keeping its relative layout
    pub async fn upload_directory(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        task_key: TaskKey,
    ) -> Result<TransferOutcome, SftpError> {
        let task = self.tasks.begin(task_key)?;
        let tree = LocalTree::scan(local_dir).await?;
        let mut reporter = self.reporter(&task, TransferKind::Upload, tree.total);

        tracing::info!(
            "[{}] upload dir {} -> {} ({} files, {} bytes)",
            self.session_id,
            local_dir.display(),
            remote_dir,
            tree.files.len(),
            tree.total
        );

        let result = async {
            self.ensure_dir(remote_dir).await?;
            for dir in &tree.dirs {
                self.ensure_dir(&remote_join(remote_dir, dir)).await?;
            }

            let mut transferred = 0;
            for (relative, _) in &tree.files {
                let remote_path = remote_join(remote_dir, relative);
                let mut reader = tokio::fs::File::open(local_dir.join(relative)).await?;
                let mut writer = self.fs.create(&remote_path).await?;
                copy_chunks(
                    &mut reader,
                    &mut writer,
                    self.chunk_size,
                    &remote_path,
                    &mut transferred,
                    &mut reporter,
                )
                .await?;
            }
            Ok::<(), SftpError>(())
        }
        .await;

        self.conclude(&task, &reporter, result)
    }

    /// Download one remote file
    pub async fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        task_key: TaskKey,
    ) -> Result<TransferOutcome, SftpError> {
        let task = self.tasks.begin(task_key)?;

        let result = async {
            let total = self.fs.stat(remote_path).await?.size;
            let mut reporter = self.reporter(&task, TransferKind::Download, total);
            tracing::info!(
                "[{}] download {} -> {} ({} bytes)",
                self.session_id,
                remote_path,
                local_path.display(),
                total
            );

            let mut reader = self.fs.open_read(remote_path).await?;
            let mut writer = tokio::fs::File::create(local_path).await?;
            let mut transferred = 0;
            copy_chunks(
                &mut reader,
                &mut writer,
                self.chunk_size,
                remote_path,
                &mut transferred,
                &mut reporter,
            )
            .await
        }
        .await;

        let reporter = self.reporter(&task, TransferKind::Download, 0);
        self.conclude(&task, &reporter, result)
    }

    /// Rename or move a remote path
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        tracing::debug!("[{}] rename {} -> {}", self.session_id, from, to);
        self.fs.rename(from, to).await
    }

    /// Delete a remote file, or a directory with everything in it
    pub async fn delete(&self, path: &str) -> Result<(), SftpError> {
        tracing::debug!("[{}] delete {}", self.session_id, path);
        // A symlink goes away on its own; its target is left alone.
        let top = self.fs.lstat(path).await?;
        if top.is_link || !top.is_dir {
            return self.fs.remove_file(path).await;
        }

        // Walk top-down, then remove directories bottom-up.
        let mut pending = vec![path.to_string()];
        let mut dirs = Vec::new();
        while let Some(dir) = pending.pop() {
            for entry in self.fs.read_dir(&dir).await? {
                if entry.is_dir && !entry.is_link {
                    pending.push(entry.path);
                } else {
                    self.fs.remove_file(&entry.path).await?;
                }
            }
            dirs.push(dir);
        }
        for dir in dirs.iter().rev() {
            self.fs.remove_dir(dir).await?;
        }
        Ok(())
    }

    /// Change permission bits, optionally for everything below a directory
    pub async fn chmod(&self, path: &str, mode: u32, recursive: bool) -> Result<(), SftpError> {
        tracing::debug!(
            "[{}] chmod {:o} {}{}",
            self.session_id,
            mode,
            path,
            if recursive { " (recursive)" } else { "" }
        );
        let top = self.fs.lstat(path).await?;
        self.fs.set_permissions(path, mode).await?;
        if !recursive || top.is_link || !top.is_dir {
            return Ok(());
        }

        let mut pending = vec![path.to_string()];
        while let Some(dir) = pending.pop() {
            for entry in self.fs.read_dir(&dir).await? {
                if entry.is_link {
                    continue;
                }
                self.fs.set_permissions(&entry.path, mode).await?;
                if entry.is_dir {
                    pending.push(entry.path);
                }
            }
        }
        Ok(())
    }

    /// Close the underlying SFTP client
    pub async fn close(&self) {
        if let Err(e) = self.fs.close().await {
            tracing::debug!("[{}] SFTP close: {}", self.session_id, e);
        }
    }

    fn reporter<'a>(
        &'a self,
        task: &'a TaskGuard,
        direction: TransferKind,
        total: u64,
    ) -> ProgressReporter<'a> {
        ProgressReporter {
            events: &self.events,
            session_id: &self.session_id,
            task,
            direction,
            total,
            throttle: ProgressThrottle::new(self.progress_interval),
        }
    }

    fn conclude(
        &self,
        task: &TaskGuard,
        reporter: &ProgressReporter<'_>,
        result: Result<(), SftpError>,
    ) -> Result<TransferOutcome, SftpError> {
        match result {
            Ok(()) => {
                let outcome = task.finish(TransferOutcome::Completed);
                reporter.finished(outcome);
                Ok(outcome)
            }
            Err(SftpError::TransferCancelled) => {
                let outcome = task.finish(TransferOutcome::Cancelled);
                tracing::info!("[{}] transfer {} cancelled", self.session_id, task.key());
                reporter.finished(outcome);
                Ok(outcome)
            }
            Err(e) => {
                let outcome = task.finish(TransferOutcome::Failed);
                reporter.finished(outcome);
                if outcome == TransferOutcome::Cancelled {
                    return Ok(outcome);
                }
                tracing::warn!("[{}] transfer {} failed: {}", self.session_id, task.key(), e);
                Err(e)
            }
        }
    }

    /// Create a remote directory unless it already exists
    async fn ensure_dir(&self, path: &str) -> Result<(), SftpError> {
        match self.fs.mkdir(path).await {
            Ok(()) => Ok(()),
            Err(e) => match self.fs.stat(path).await {
                Ok(stat) if stat.is_dir => Ok(()),
                _ => Err(e),
            },
        }
    }
}

/// Files and directories below a local root, relative to it
struct LocalTree {
    dirs: Vec<PathBuf>,
    files: Vec<(PathBuf, u64)>,
    total: u64,
}

impl LocalTree {
    async fn scan(root: &Path) -> Result<Self, SftpError> {
        let mut tree = LocalTree {
            dirs: Vec::new(),
            files: Vec::new(),
            total: 0,
        };
        let mut pending = vec![PathBuf::new()];

        while let Some(relative) = pending.pop() {
            let mut entries = tokio::fs::read_dir(root.join(&relative)).await?;
            let mut children = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                children.push(entry);
            }
            children.sort_by_key(|e| e.file_name());

            for entry in children {
                let path = relative.join(entry.file_name());
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    tree.dirs.push(path.clone());
                    pending.push(path);
                } else if meta.is_file() {
                    tree.total += meta.len();
                    tree.files.push((path, meta.len()));
                }
            }
        }

        // Parents before children.
        tree.dirs.sort();
        Ok(tree)
    }
}

/// Join a local relative path onto a remote directory with `/`
fn remote_join(base: &str, relative: &Path) -> String {
    let mut joined = base.trim_end_matches('/').to_string();
    for part in relative.components() {
        joined.push('/');
        joined.push_str(&part.as_os_str().to_string_lossy());
    }
    joined
}
