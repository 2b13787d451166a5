//! Transport layer
//!
//! A [`Transport`] is one SSH connection to one host. It owns its link
//! exclusively; closing it (or losing the socket) cancels its close token,
//! which every channel opened over it watches. Tunneled transports keep their
//! parent hop alive and close it after themselves.

mod health;
pub mod ssh;

pub use health::HealthWatch;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use tl_core::error::TransportError;
use tl_core::traits::{
    BoxedStream, ChannelRequest, Connector, HostTarget, LinkChannel, SshLink, StreamRequest,
};
use tl_core::types::{AuthMethod, AuthState};

use crate::auth::{AuthContext, AuthCoordinator, AuthObserver};

/// Slot reserved for one channel; released on drop
pub type ChannelSlot = OwnedSemaphorePermit;

/// One SSH connection to one host
pub struct Transport {
    /// Short label for logs (`user@host:port`)
    label: String,
    /// Where this transport goes
    target: HostTarget,
    /// The SSH link
    link: Box<dyn SshLink>,
    /// Authentication state, written only by the coordinator
    auth_state: watch::Sender<AuthState>,
    /// Channel slots
    slots: Arc<Semaphore>,
    /// Cancelled when the transport goes away for any reason
    closed: CancellationToken,
    /// Set when the close was requested rather than caused by a failure
    close_requested: AtomicBool,
    /// Previous hop this transport is tunneled through
    parent: Option<Arc<Transport>>,
    /// Slot of the forwarded channel on the parent carrying this transport
    _tunnel: Option<ChannelSlot>,
}

impl Transport {
    /// Connect directly over TCP
    pub async fn connect(
        connector: &dyn Connector,
        target: HostTarget,
        timeout: Duration,
        max_channels: usize,
    ) -> Result<Self, TransportError> {
        tracing::debug!("Connecting to {}", target.address());

        let link = tokio::time::timeout(timeout, connector.connect(&target))
            .await
            .map_err(|_| {
                TransportError::NetworkUnreachable(format!(
                    "Connection to {} timed out",
                    target.address()
                ))
            })??;

        Ok(Self::new(link, target, max_channels, None))
    }

    /// Connect over a stream opened on `parent`
    pub async fn connect_over(
        connector: &dyn Connector,
        (stream, tunnel): (BoxedStream, ChannelSlot),
        target: HostTarget,
        timeout: Duration,
        max_channels: usize,
        parent: Arc<Transport>,
    ) -> Result<Self, TransportError> {
        tracing::debug!(
            "Connecting to {} through {}",
            target.address(),
            parent.label()
        );

        let link = tokio::time::timeout(timeout, connector.connect_over(stream, &target))
            .await
            .map_err(|_| {
                TransportError::NetworkUnreachable(format!(
                    "Tunneled connection to {} timed out",
                    target.address()
                ))
            })??;

        let mut transport = Self::new(link, target, max_channels, Some(parent));
        transport._tunnel = Some(tunnel);
        Ok(transport)
    }

    fn new(
        link: Box<dyn SshLink>,
        target: HostTarget,
        max_channels: usize,
        parent: Option<Arc<Transport>>,
    ) -> Self {
        let (auth_state, _) = watch::channel(AuthState::Unauthenticated);
        // Tunneled transports die with their parent.
        let closed = match &parent {
            Some(parent) => parent.closed.child_token(),
            None => CancellationToken::new(),
        };

        Self {
            label: target.address(),
            target,
            link,
            auth_state,
            slots: Arc::new(Semaphore::new(max_channels)),
            closed,
            close_requested: AtomicBool::new(false),
            parent,
            _tunnel: None,
        }
    }

    /// Authenticate through the coordinator
    pub async fn authenticate(
        &mut self,
        coordinator: &AuthCoordinator,
        ctx: &AuthContext,
        username: &str,
        method: &AuthMethod,
        observer: &dyn AuthObserver,
    ) -> Result<(), TransportError> {
        self.label = format!("{}@{}", username, self.target.address());
        coordinator
            .authenticate(
                self.link.as_mut(),
                &self.auth_state,
                ctx,
                username,
                method,
                observer,
            )
            .await
    }

    /// Open a byte channel
    pub async fn open_channel(
        &self,
        request: ChannelRequest,
    ) -> Result<(LinkChannel, ChannelSlot), TransportError> {
        let slot = self.reserve_slot()?;
        let channel = self.link.open_channel(request).await.map_err(|e| {
            if self.link.is_closed() {
                self.mark_failed();
            }
            e
        })?;
        Ok((channel, slot))
    }

    /// Open a raw stream (SFTP subsystem or a forwarded connection)
    pub async fn open_stream(
        &self,
        request: StreamRequest,
    ) -> Result<(BoxedStream, ChannelSlot), TransportError> {
        let slot = self.reserve_slot()?;
        let stream = self.link.open_stream(request).await.map_err(|e| {
            if self.link.is_closed() {
                self.mark_failed();
            }
            e
        })?;
        Ok((stream, slot))
    }

    fn reserve_slot(&self) -> Result<ChannelSlot, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.auth_state.borrow().is_authenticated() {
            return Err(TransportError::NotAuthenticated);
        }
        self.slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| TransportError::ChannelLimitExceeded)
    }

    /// Close this transport, then the hops it was tunneled through.
    /// Idempotent.
    pub async fn close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        if !self.closed.is_cancelled() {
            tracing::info!("Closing transport {}", self.label);
            self.closed.cancel();
        }
        self.link.disconnect().await;

        let mut parent = self.parent.clone();
        while let Some(hop) = parent {
            hop.close_requested.store(true, Ordering::SeqCst);
            hop.closed.cancel();
            hop.link.disconnect().await;
            parent = hop.parent.clone();
        }
    }

    /// Record that the connection was lost
    pub fn mark_failed(&self) {
        if !self.closed.is_cancelled() {
            tracing::warn!("Transport {} lost", self.label);
            self.closed.cancel();
        }
    }

    /// Token cancelled when the transport goes away
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Whether the transport is gone
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Whether the transport went away without being asked to
    pub fn has_failed(&self) -> bool {
        self.closed.is_cancelled() && !self.close_requested.load(Ordering::SeqCst)
    }

    /// Whether the socket of this hop, or of any hop below it, is gone
    pub fn link_lost(&self) -> bool {
        let mut hop = Some(self);
        while let Some(t) = hop {
            if t.link.is_closed() {
                return true;
            }
            hop = t.parent.as_deref();
        }
        false
    }

    /// Current authentication state
    pub fn auth_state(&self) -> AuthState {
        self.auth_state.borrow().clone()
    }

    /// Observe authentication state changes
    pub fn watch_auth(&self) -> watch::Receiver<AuthState> {
        self.auth_state.subscribe()
    }

    /// Label for logs
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Target of this hop
    pub fn target(&self) -> &HostTarget {
        &self.target
    }

    /// Number of hops below this one (0 for a direct connection)
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut parent = self.parent.as_ref();
        while let Some(hop) = parent {
            depth += 1;
            parent = hop.parent.as_ref();
        }
        depth
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("label", &self.label)
            .field("depth", &self.depth())
            .field("auth_state", &self.auth_state())
            .field("closed", &self.is_closed())
            .finish()
    }
}
