//! File transfer tasks
//!
//! Each transfer runs under a [`TransferTask`] registered by its key. The task
//! state moves out of `Running` exactly once, whether by cancellation or by
//! natural completion, so a cancel racing the last chunk has a single winner.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tl_core::error::SftpError;
use tl_protocol::{
    CoreEvent, SessionId, SftpEvent, TaskKey, TransferKind, TransferOutcome, TransferProgress,
};

use crate::events::EventBus;

const RUNNING: u8 = 0;
const CANCELLED: u8 = 1;
const COMPLETED: u8 = 2;
const FAILED: u8 = 3;

/// One running transfer
pub struct TransferTask {
    key: TaskKey,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl TransferTask {
    fn new(key: TaskKey) -> Self {
        Self {
            key,
            state: AtomicU8::new(RUNNING),
            cancel: CancellationToken::new(),
        }
    }

    /// Task key
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Request cancellation. Returns `false` if the task already finished.
    pub fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(RUNNING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.cancel.cancel();
        }
        won
    }

    /// Whether cancellation won
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }

    /// Move to a terminal state, returning the outcome that actually applies
    pub fn finish(&self, outcome: TransferOutcome) -> TransferOutcome {
        let target = match outcome {
            TransferOutcome::Completed => COMPLETED,
            TransferOutcome::Cancelled => CANCELLED,
            TransferOutcome::Failed => FAILED,
        };
        match self
            .state
            .compare_exchange(RUNNING, target, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => outcome,
            Err(CANCELLED) => TransferOutcome::Cancelled,
            Err(COMPLETED) => TransferOutcome::Completed,
            Err(_) => TransferOutcome::Failed,
        }
    }

    async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Running transfers by key
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskKey, Arc<TransferTask>>,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task
    pub fn begin(self: &Arc<Self>, key: TaskKey) -> Result<TaskGuard, SftpError> {
        let task = match self.tasks.entry(key.clone()) {
            Entry::Occupied(_) => return Err(SftpError::TaskExists(key.to_string())),
            Entry::Vacant(slot) => slot.insert(Arc::new(TransferTask::new(key))).clone(),
        };
        Ok(TaskGuard {
            registry: self.clone(),
            task,
        })
    }

    /// Cancel a task. Returns `false` if no such task is running.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        let task = self.tasks.get(key).map(|t| t.clone());
        match task {
            Some(task) => {
                tracing::info!("Cancelling transfer {}", key);
                task.cancel()
            }
            None => false,
        }
    }

    /// Whether a task with this key is running
    pub fn contains(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    /// Number of running tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if no task is running
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Keeps a task registered until dropped
pub struct TaskGuard {
    registry: Arc<TaskRegistry>,
    task: Arc<TransferTask>,
}

impl std::ops::Deref for TaskGuard {
    type Target = TransferTask;

    fn deref(&self) -> &TransferTask {
        &self.task
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let key = self.task.key.clone();
        self.registry
            .tasks
            .remove_if(&key, |_, t| Arc::ptr_eq(t, &self.task));
    }
}

/// Rate limit for progress events
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    /// Allow at most one report per `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether a report is due now. The first report and the final one
    /// always go out.
    pub fn ready(&mut self, finished: bool) -> bool {
        let now = Instant::now();
        let due = match self.last {
            None => true,
            Some(last) => finished || now.duration_since(last) >= self.interval,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

/// Emits throttled progress for one task
pub struct ProgressReporter<'a> {
    pub(crate) events: &'a EventBus,
    pub(crate) session_id: &'a SessionId,
    pub(crate) task: &'a TransferTask,
    pub(crate) direction: TransferKind,
    pub(crate) total: u64,
    pub(crate) throttle: ProgressThrottle,
}

impl ProgressReporter<'_> {
    /// Report `bytes` transferred so far against `remote_path`
    pub fn report(&mut self, remote_path: &str, bytes: u64) {
        // Nothing after a cancel.
        if self.task.is_cancelled() {
            return;
        }
        if !self.throttle.ready(bytes >= self.total) {
            return;
        }
        tracing::trace!("Transfer {}: {}/{}", self.task.key(), bytes, self.total);
        self.events
            .emit(CoreEvent::Sftp(SftpEvent::Progress(TransferProgress {
                session_id: self.session_id.clone(),
                task_key: self.task.key().clone(),
                remote_path: remote_path.to_string(),
                bytes,
                total: self.total,
                direction: self.direction,
            })));
    }

    /// Announce the terminal state
    pub fn finished(&self, outcome: TransferOutcome) {
        self.events.emit(CoreEvent::Sftp(SftpEvent::Finished {
            session_id: self.session_id.clone(),
            task_key: self.task.key().clone(),
            outcome,
        }));
    }
}

fn local_error(e: io::Error) -> SftpError {
    SftpError::Io(e)
}

fn remote_error(e: io::Error) -> SftpError {
    SftpError::Remote(e.to_string())
}

/// Copy `reader` into `writer` in chunks, checking for cancellation
/// before each chunk.
pub(crate) async fn copy_chunks<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
    remote_path: &str,
    transferred: &mut u64,
    reporter: &mut ProgressReporter<'_>,
) -> Result<(), SftpError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let task = reporter.task;
    let (read_error, write_error): (fn(io::Error) -> SftpError, fn(io::Error) -> SftpError) =
        match reporter.direction {
            TransferKind::Upload => (local_error, remote_error),
            TransferKind::Download => (remote_error, local_error),
        };
    let mut buf = vec![0u8; chunk_size.max(1)];

    loop {
        if task.is_cancelled() {
            return Err(SftpError::TransferCancelled);
        }

        let n = tokio::select! {
            biased;
            _ = task.cancelled() => return Err(SftpError::TransferCancelled),
            read = reader.read(&mut buf) => read.map_err(read_error)?,
        };
        if n == 0 {
            break;
        }

        tokio::select! {
            biased;
            _ = task.cancelled() => return Err(SftpError::TransferCancelled),
            written = writer.write_all(&buf[..n]) => written.map_err(write_error)?,
        }

        *transferred += n as u64;
        reporter.report(remote_path, *transferred);
    }

    writer.flush().await.map_err(write_error)?;
    writer.shutdown().await.map_err(write_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_wins_once() {
        let task = TransferTask::new(TaskKey::new("t1"));
        assert!(task.cancel());
        assert!(!task.cancel());
        assert_eq!(task.finish(TransferOutcome::Completed), TransferOutcome::Cancelled);
    }

    #[test]
    fn test_completion_beats_late_cancel() {
        let task = TransferTask::new(TaskKey::new("t1"));
        assert_eq!(task.finish(TransferOutcome::Completed), TransferOutcome::Completed);
        assert!(!task.cancel());
        assert!(!task.is_cancelled());
    }

    #[test]
    fn test_registry_rejects_duplicate_keys() {
        let registry = Arc::new(TaskRegistry::new());
        let guard = registry.begin(TaskKey::new("t1")).unwrap();
        assert!(matches!(
            registry.begin(TaskKey::new("t1")),
            Err(SftpError::TaskExists(_))
        ));

        drop(guard);
        assert!(registry.is_empty());
        assert!(registry.begin(TaskKey::new("t1")).is_ok());
    }

    #[test]
    fn test_cancel_unknown_task() {
        let registry = TaskRegistry::new();
        assert!(!registry.cancel(&TaskKey::new("missing")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_limits_rate() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(100));
        assert!(throttle.ready(false));
        assert!(!throttle.ready(false));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(!throttle.ready(false));
        assert!(throttle.ready(true));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(throttle.ready(false));
    }

    #[tokio::test]
    async fn test_copy_stops_after_cancel() {
        let registry = Arc::new(TaskRegistry::new());
        let task = registry.begin(TaskKey::new("t1")).unwrap();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let session_id = SessionId::new("s1");
        let mut reporter = ProgressReporter {
            events: &events,
            session_id: &session_id,
            task: &task,
            direction: TransferKind::Upload,
            total: 8,
            throttle: ProgressThrottle::new(Duration::ZERO),
        };

        task.cancel();
        let mut reader: &[u8] = b"abcdefgh";
        let mut out = Vec::new();
        let mut transferred = 0;
        let result = copy_chunks(
            &mut reader,
            &mut out,
            4,
            "/tmp/x",
            &mut transferred,
            &mut reporter,
        )
        .await;

        assert!(matches!(result, Err(SftpError::TransferCancelled)));
        assert!(out.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_copy_reports_progress() {
        let registry = Arc::new(TaskRegistry::new());
        let task = registry.begin(TaskKey::new("t1")).unwrap();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let session_id = SessionId::new("s1");
        let mut reporter = ProgressReporter {
            events: &events,
            session_id: &session_id,
            task: &task,
            direction: TransferKind::Download,
            total: 8,
            throttle: ProgressThrottle::new(Duration::ZERO),
        };

        let mut reader: &[u8] = b"abcdefgh";
        let mut out = Vec::new();
        let mut transferred = 0;
        copy_chunks(
            &mut reader,
            &mut out,
            4,
            "/tmp/x",
            &mut transferred,
            &mut reporter,
        )
        .await
        .unwrap();

        assert_eq!(out, b"abcdefgh");
        let mut seen = Vec::new();
        while let Ok(CoreEvent::Sftp(SftpEvent::Progress(p))) = rx.try_recv() {
            seen.push(p.bytes);
        }
        assert_eq!(seen, [4, 8]);
    }
}
