//! Inbound fan-out to registered consumers
//!
//! Every event goes to every live consumer, in arrival order. Delivery waits
//! on slow consumers instead of dropping, so backpressure reaches the remote
//! side through the link's flow control. An event nobody is registered for
//! comes back to the caller as [`Delivery::Unclaimed`].

use std::sync::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use tl_protocol::ShellEvent;

/// Outcome of one delivery
#[derive(Debug)]
pub enum Delivery {
    /// At least one consumer took the event
    Delivered,
    /// No live consumer; the event is handed back
    Unclaimed(ShellEvent),
    /// The stop token fired first
    Stopped,
}

/// Registered consumers of one channel
pub struct ConsumerSet {
    senders: Mutex<Vec<mpsc::Sender<ShellEvent>>>,
    registered: Notify,
    depth: usize,
}

impl ConsumerSet {
    /// Create a set whose consumers queue up to `depth` events
    pub fn new(depth: usize) -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
            registered: Notify::new(),
            depth: depth.max(1),
        }
    }

    /// Register a new consumer
    pub fn subscribe(&self) -> mpsc::Receiver<ShellEvent> {
        let (tx, rx) = mpsc::channel(self.depth);
        if let Ok(mut senders) = self.senders.lock() {
            senders.push(tx);
        }
        self.registered.notify_waiters();
        self.registered.notify_one();
        rx
    }

    /// Number of live consumers
    pub fn len(&self) -> usize {
        self.senders
            .lock()
            .map(|s| s.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Check if there are no live consumers
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one event to every live consumer
    pub async fn deliver(&self, event: ShellEvent, stop: &CancellationToken) -> Delivery {
        let targets = self.live_senders();
        if targets.is_empty() {
            return Delivery::Unclaimed(event);
        }

        let mut delivered = 0;
        for tx in &targets {
            tokio::select! {
                sent = tx.send(event.clone()) => {
                    if sent.is_ok() {
                        delivered += 1;
                    }
                }
                _ = stop.cancelled() => return Delivery::Stopped,
            }
        }
        self.prune();

        if delivered > 0 {
            Delivery::Delivered
        } else {
            Delivery::Unclaimed(event)
        }
    }

    /// Resolves after a consumer registers
    pub async fn registered(&self) {
        self.registered.notified().await
    }

    /// Deliver a final event without waiting on anyone, then drop every
    /// consumer so their receivers end.
    pub fn finish(&self, event: ShellEvent) {
        let senders = match self.senders.lock() {
            Ok(mut senders) => std::mem::take(&mut *senders),
            Err(_) => return,
        };
        for tx in senders {
            if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event.clone()) {
                // Hand the last event over in the background so a full queue
                // does not hold up teardown.
                tokio::spawn(async move {
                    let _ = tx.send(event).await;
                });
            }
        }
    }

    fn live_senders(&self) -> Vec<mpsc::Sender<ShellEvent>> {
        self.senders
            .lock()
            .map(|s| s.iter().filter(|tx| !tx.is_closed()).cloned().collect())
            .unwrap_or_default()
    }

    fn prune(&self) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.retain(|tx| !tx.is_closed());
        }
    }
}
