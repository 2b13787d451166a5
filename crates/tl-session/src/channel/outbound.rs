//! Outbound byte budget and pump
//!
//! Writers reserve buffer space before queueing bytes; the pump releases it
//! once the link has accepted them. A writer that cannot get space within the
//! drain timeout fails with `WouldBlock`.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use tl_core::error::ChannelError;
use tl_core::traits::ChannelControl;

/// Largest budget one reservation can cover
const MAX_BUDGET: usize = u32::MAX as usize;

struct Queued {
    data: Bytes,
    _reservation: OwnedSemaphorePermit,
}

/// Bounded outbound queue of one channel
pub struct Outbound {
    queue: mpsc::UnboundedSender<Queued>,
    budget: Arc<Semaphore>,
    capacity: usize,
    drain_timeout: Duration,
}

impl Outbound {
    /// Create the queue and start its pump
    pub fn spawn(
        control: Arc<dyn ChannelControl>,
        capacity: usize,
        drain_timeout: Duration,
        closed: CancellationToken,
        label: String,
    ) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS.min(MAX_BUDGET));
        let (queue, rx) = mpsc::unbounded_channel();
        let budget = Arc::new(Semaphore::new(capacity));

        tokio::spawn(pump(rx, control, closed, budget.clone(), label));

        Self {
            queue,
            budget,
            capacity,
            drain_timeout,
        }
    }

    /// Queue bytes for the link
    pub async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        if data.is_empty() {
            return Ok(());
        }

        // A write larger than the whole buffer waits for an empty buffer.
        let needed = u32::try_from(data.len().min(self.capacity)).unwrap_or(u32::MAX);
        let reservation = tokio::time::timeout(
            self.drain_timeout,
            self.budget.clone().acquire_many_owned(needed),
        )
        .await
        .map_err(|_| ChannelError::WouldBlock)?
        .map_err(|_| ChannelError::Closed("outbound queue closed".to_string()))?;

        self.queue
            .send(Queued {
                data,
                _reservation: reservation,
            })
            .map_err(|_| ChannelError::Closed("outbound queue closed".to_string()))
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.capacity - self.budget.available_permits()
    }
}

async fn pump(
    mut rx: mpsc::UnboundedReceiver<Queued>,
    control: Arc<dyn ChannelControl>,
    closed: CancellationToken,
    budget: Arc<Semaphore>,
    label: String,
) {
    loop {
        let queued = tokio::select! {
            _ = closed.cancelled() => break,
            queued = rx.recv() => match queued {
                Some(queued) => queued,
                None => break,
            },
        };

        tracing::trace!("{}: writing {} bytes", label, queued.data.len());
        if let Err(e) = control.write(queued.data).await {
            tracing::debug!("{}: write failed: {}", label, e);
            break;
        }
    }

    // Fail any writer still waiting for space.
    budget.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tl_protocol::TerminalSize;

    /// Link that records writes and only accepts them while the gate has
    /// permits.
    struct GatedControl {
        gate: Arc<Semaphore>,
        written: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl ChannelControl for GatedControl {
        async fn write(&self, data: Bytes) -> Result<(), ChannelError> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| ChannelError::Closed("gate".into()))?;
            permit.forget();
            self.written.lock().unwrap().push(data);
            Ok(())
        }

        async fn resize(&self, _size: TerminalSize) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn eof(&self) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_fails_with_would_block() {
        let control = Arc::new(GatedControl {
            gate: Arc::new(Semaphore::new(0)),
            written: Mutex::new(Vec::new()),
        });
        let outbound = Outbound::spawn(
            control.clone(),
            8,
            Duration::from_secs(10),
            CancellationToken::new(),
            "test".into(),
        );

        outbound.send(Bytes::from_static(b"12345678")).await.unwrap();
        assert_eq!(outbound.buffered(), 8);

        let blocked = outbound.send(Bytes::from_static(b"x")).await;
        assert_eq!(blocked, Err(ChannelError::WouldBlock));
    }

    #[tokio::test]
    async fn test_drained_bytes_free_the_buffer() {
        let control = Arc::new(GatedControl {
            gate: Arc::new(Semaphore::new(100)),
            written: Mutex::new(Vec::new()),
        });
        let outbound = Outbound::spawn(
            control.clone(),
            4,
            Duration::from_secs(10),
            CancellationToken::new(),
            "test".into(),
        );

        for chunk in [&b"ab"[..], b"cd", b"ef", b"gh"] {
            outbound.send(Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        while control.written.lock().unwrap().len() < 4 {
            tokio::task::yield_now().await;
        }
        let written = control.written.lock().unwrap().concat();
        assert_eq!(written, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_oversized_budget_is_clamped() {
        let control = Arc::new(GatedControl {
            gate: Arc::new(Semaphore::new(0)),
            written: Mutex::new(Vec::new()),
        });
        let outbound = Outbound::spawn(
            control,
            usize::MAX,
            Duration::from_secs(10),
            CancellationToken::new(),
            "test".into(),
        );
        assert!(outbound.capacity <= u32::MAX as usize);

        outbound.send(Bytes::from(vec![0u8; 70_000])).await.unwrap();
        assert_eq!(outbound.buffered(), 70_000);
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_writes() {
        let control = Arc::new(GatedControl {
            gate: Arc::new(Semaphore::new(0)),
            written: Mutex::new(Vec::new()),
        });
        let closed = CancellationToken::new();
        let outbound = Outbound::spawn(
            control,
            4,
            Duration::from_secs(10),
            closed.clone(),
            "test".into(),
        );
        closed.cancel();
        // Let the pump observe the cancellation.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let result = outbound.send(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(ChannelError::Closed(_))));
    }
}
