//! Transport liveness watch

use std::sync::Weak;
use std::time::Duration;

use super::Transport;

/// Periodically checks that a transport's socket is still there
pub struct HealthWatch {
    /// Check interval
    pub interval: Duration,
}

impl HealthWatch {
    /// Create a new health watch
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Start watching a transport.
    ///
    /// The task ends when the transport closes or is dropped. A lost socket
    /// cancels the transport's close token, which cascades to its channels.
    pub fn spawn_watch(&self, transport: Weak<Transport>) -> tokio::task::JoinHandle<()> {
        let interval = self.interval;

        tokio::spawn(async move {
            let closed = match transport.upgrade() {
                Some(t) => t.closed_token(),
                None => return,
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(transport) = transport.upgrade() else {
                            break;
                        };
                        if transport.link_lost() {
                            transport.mark_failed();
                            break;
                        }
                    }
                }
            }
        })
    }
}
