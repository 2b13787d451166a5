//! Channels
//!
//! A [`ChannelHandle`] wraps one opened [`LinkChannel`]. A single demux task
//! owns the inbound side and fans every chunk out to the registered
//! consumers; writes go through a bounded outbound queue drained by a pump.
//! Output that arrives before anyone subscribes is kept in a bounded backlog
//! (oldest dropped first) and the channel still closes with nobody attached.
//! The channel closes on remote close, an explicit close, or when the
//! transport it runs over goes away.

mod consumers;
mod outbound;

pub use consumers::{ConsumerSet, Delivery};
pub use outbound::Outbound;

use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tl_core::config::CoreConfig;
use tl_core::error::ChannelError;
use tl_core::traits::{ChannelControl, ChannelInput, LinkChannel};
use tl_core::types::{ChannelMode, ChannelPurpose};
use tl_protocol::{ChannelId, ShellEvent, TerminalSize};

use crate::transport::ChannelSlot;

/// Why a channel ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Closed locally
    Requested,
    /// The remote side closed it. `clean` when it reported an exit status
    /// or EOF first.
    Remote { clean: bool },
    /// The transport went away underneath it
    TransportLost,
}

/// Called once when a channel has fully closed
pub type CloseHook = Box<dyn FnOnce(&ChannelId, CloseCause) + Send>;

/// Buffer sizing for a channel
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// Outbound buffer in bytes
    pub outbound_bytes: usize,
    /// How long a write may wait for buffer space
    pub drain_timeout: Duration,
    /// Events queued per consumer, and kept while nobody is subscribed
    pub consumer_depth: usize,
}

impl ChannelOptions {
    /// Options from the core configuration
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            outbound_bytes: config.outbound_buffer_bytes,
            drain_timeout: config.write_drain_timeout,
            consumer_depth: config.consumer_queue_depth,
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from_config(&CoreConfig::default())
    }
}

/// One open channel
pub struct ChannelHandle {
    id: ChannelId,
    purpose: ChannelPurpose,
    control: Arc<dyn ChannelControl>,
    outbound: Outbound,
    consumers: Arc<ConsumerSet>,
    closed: CancellationToken,
    close_requested: Arc<AtomicBool>,
}

impl ChannelHandle {
    /// Start serving an opened link channel.
    ///
    /// `parent` is the transport's close token; cancelling it closes the
    /// channel. The slot is held until the channel has closed.
    pub fn spawn(
        id: ChannelId,
        purpose: ChannelPurpose,
        link: LinkChannel,
        slot: Option<ChannelSlot>,
        parent: &CancellationToken,
        options: ChannelOptions,
        on_close: CloseHook,
    ) -> Arc<Self> {
        let closed = parent.child_token();
        let consumers = Arc::new(ConsumerSet::new(options.consumer_depth));
        let close_requested = Arc::new(AtomicBool::new(false));
        let outbound = Outbound::spawn(
            link.control.clone(),
            options.outbound_bytes,
            options.drain_timeout,
            closed.clone(),
            id.to_string(),
        );

        let demux = Demux {
            id: id.clone(),
            inbound: link.inbound,
            control: link.control.clone(),
            consumers: consumers.clone(),
            closed: closed.clone(),
            parent: parent.clone(),
            close_requested: close_requested.clone(),
            backlog: VecDeque::new(),
            backlog_limit: options.consumer_depth.max(1),
            slot,
            on_close,
        };
        tokio::spawn(demux.run());

        tracing::debug!("Channel {} ({}) open", id, purpose);

        Arc::new(Self {
            id,
            purpose,
            control: link.control,
            outbound,
            consumers,
            closed,
            close_requested,
        })
    }

    /// Channel id
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// What the channel is for
    pub fn purpose(&self) -> ChannelPurpose {
        self.purpose
    }

    /// Channel mode
    pub fn mode(&self) -> ChannelMode {
        self.purpose.mode()
    }

    /// Whether the channel has closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the channel closes
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Register a consumer for inbound events
    pub fn subscribe(&self) -> mpsc::Receiver<ShellEvent> {
        self.consumers.subscribe()
    }

    /// Number of registered consumers
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Queue bytes for the remote side.
    ///
    /// Waits for buffer space up to the drain timeout, then fails with
    /// `WouldBlock`.
    pub async fn write(&self, data: Bytes) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.outbound.send(data).await.map_err(|e| match e {
            ChannelError::Closed(_) => self.closed_error(),
            other => other,
        })
    }

    /// Change the PTY size. Shell channels only.
    pub async fn resize(&self, size: TerminalSize) -> Result<(), ChannelError> {
        if self.mode() != ChannelMode::Shell {
            return Err(ChannelError::NotAPty(self.id.to_string()));
        }
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.control.resize(size).await
    }

    /// Signal end of input
    pub async fn eof(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.control.eof().await
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        if !self.close_requested.swap(true, Ordering::SeqCst) {
            tracing::debug!("Closing channel {}", self.id);
        }
        self.closed.cancel();
    }

    fn closed_error(&self) -> ChannelError {
        ChannelError::Closed(self.id.to_string())
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("purpose", &self.purpose)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Inbound side of one channel
struct Demux {
    id: ChannelId,
    inbound: mpsc::Receiver<ChannelInput>,
    control: Arc<dyn ChannelControl>,
    consumers: Arc<ConsumerSet>,
    closed: CancellationToken,
    parent: CancellationToken,
    close_requested: Arc<AtomicBool>,
    /// Events nobody was subscribed for yet
    backlog: VecDeque<ShellEvent>,
    backlog_limit: usize,
    slot: Option<ChannelSlot>,
    on_close: CloseHook,
}

impl Demux {
    async fn run(mut self) {
        let mut exit_code = None;
        let mut eof = false;

        'demux: loop {
            while let Some(event) = self.backlog.pop_front() {
                match self.consumers.deliver(event, &self.closed).await {
                    Delivery::Delivered => {}
                    Delivery::Unclaimed(event) => {
                        self.backlog.push_front(event);
                        break;
                    }
                    Delivery::Stopped => break 'demux,
                }
            }

            // Inbound keeps being read while parked so EOF and the end of
            // the stream are seen even if nobody ever subscribes.
            let parked = !self.backlog.is_empty();
            let input = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                _ = self.consumers.registered(), if parked => continue,
                input = self.inbound.recv() => input,
            };

            let event = match input {
                Some(ChannelInput::Data(data)) => ShellEvent::Data {
                    channel_id: self.id.clone(),
                    data,
                },
                Some(ChannelInput::Stderr(data)) => ShellEvent::Stderr {
                    channel_id: self.id.clone(),
                    data,
                },
                Some(ChannelInput::ExitStatus(code)) => {
                    tracing::debug!("Channel {} exited with {}", self.id, code);
                    exit_code = Some(code);
                    continue;
                }
                Some(ChannelInput::Eof) => {
                    eof = true;
                    continue;
                }
                None => break,
            };

            if parked {
                self.park(event);
                continue;
            }
            match self.consumers.deliver(event, &self.closed).await {
                Delivery::Delivered => {}
                Delivery::Unclaimed(event) => self.park(event),
                Delivery::Stopped => break,
            }
        }

        self.closed.cancel();

        let cause = if self.close_requested.load(Ordering::SeqCst) {
            CloseCause::Requested
        } else if self.parent.is_cancelled() {
            CloseCause::TransportLost
        } else {
            CloseCause::Remote {
                clean: exit_code.is_some() || eof,
            }
        };

        if cause != CloseCause::TransportLost {
            if let Err(e) = self.control.close().await {
                tracing::trace!("Channel {} close: {}", self.id, e);
            }
        }

        tracing::debug!("Channel {} closed ({:?})", self.id, cause);
        self.consumers.finish(ShellEvent::Close {
            channel_id: self.id.clone(),
            exit_code,
        });

        drop(self.slot.take());
        (self.on_close)(&self.id, cause);
    }

    fn park(&mut self, event: ShellEvent) {
        self.backlog.push_back(event);
        if self.backlog.len() > self.backlog_limit {
            self.backlog.pop_front();
            tracing::trace!("Channel {}: backlog full, dropped oldest event", self.id);
        }
    }
}
