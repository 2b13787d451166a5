//! Broadcast bus for non-byte events
//!
//! Auth, selection, SFTP and lifecycle events fan out to every subscriber.
//! Shell bytes do not travel here; they go to per-channel consumers.

use tokio::sync::broadcast;

use tl_protocol::CoreEvent;

/// Capacity of the event bus.
///
/// Subscribers that fall further behind than this observe a lag error and
/// skip ahead.
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Fan-out of [`CoreEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
