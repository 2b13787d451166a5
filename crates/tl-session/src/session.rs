//! Sessions
//!
//! A [`Session`] groups one transport (or one local shell) with the channels
//! opened on it. Every state change is published on the event bus.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio_util::sync::CancellationToken;

use dashmap::DashMap;
use tl_core::config::CoreConfig;
use tl_core::error::{ChannelError, CoreError, SessionError, TransportError};
use tl_core::traits::{LinkChannel, RemoteFsFactory, StreamRequest};
use tl_core::types::{ChannelPurpose, ConnectionParams, LocalShellParams, SessionKind, SessionState};
use tl_protocol::{ChannelId, ChannelSummary, CoreEvent, SessionEvent, SessionId, SessionInfo};

use crate::auth::AuthObserver;
use crate::channel::{ChannelHandle, ChannelOptions, CloseCause};
use crate::events::EventBus;
use crate::sftp::{SftpChannel, TaskRegistry};
use crate::transport::{ChannelSlot, Transport};

/// What a session connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionParams {
    Remote(ConnectionParams),
    Local(LocalShellParams),
}

impl SessionParams {
    /// Kind of session these parameters open
    pub fn kind(&self) -> SessionKind {
        match self {
            SessionParams::Remote(_) => SessionKind::Remote,
            SessionParams::Local(_) => SessionKind::Local,
        }
    }
}

/// One caller-facing session
pub struct Session {
    id: SessionId,
    params: SessionParams,
    events: EventBus,
    options: ChannelOptions,
    state: Mutex<SessionState>,
    /// Shown in listings: `user@host:port` or the local shell
    target: RwLock<String>,
    transport: RwLock<Option<Arc<Transport>>>,
    /// Parent token of local channels
    local_closed: CancellationToken,
    channels: DashMap<u32, Arc<ChannelHandle>>,
    next_channel: AtomicU32,
    sftp: tokio::sync::Mutex<Option<Arc<SftpChannel>>>,
    /// Held while the shell channel is looked up or opened
    shell_open: tokio::sync::Mutex<()>,
}

impl Session {
    /// Create a session in the `Connecting` state.
    ///
    /// Channel numbers start at `first_channel`, so ids handed out by an
    /// earlier session with the same id are never reused.
    pub fn new(
        id: SessionId,
        params: SessionParams,
        events: EventBus,
        options: ChannelOptions,
        first_channel: u32,
    ) -> Arc<Self> {
        let target = match &params {
            SessionParams::Remote(p) => p.display_target(),
            SessionParams::Local(p) => p.shell.clone().unwrap_or_default(),
        };
        let first_channel = first_channel.max(1);

        let session = Arc::new(Self {
            id,
            params,
            events,
            options,
            state: Mutex::new(SessionState::Connecting),
            target: RwLock::new(target),
            transport: RwLock::new(None),
            local_closed: CancellationToken::new(),
            channels: DashMap::new(),
            next_channel: AtomicU32::new(first_channel),
            sftp: tokio::sync::Mutex::new(None),
            shell_open: tokio::sync::Mutex::new(()),
        });
        session.publish(SessionState::Connecting);
        session
    }

    /// Serializes shell lookup-or-open so concurrent callers share one
    /// channel
    pub async fn lock_shell(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.shell_open.lock().await
    }

    /// Session id
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Remote or local
    pub fn kind(&self) -> SessionKind {
        self.params.kind()
    }

    /// Parameters the session was opened with
    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Remote connection parameters
    pub fn remote_params(&self) -> Result<&ConnectionParams, SessionError> {
        match &self.params {
            SessionParams::Remote(params) => Ok(params),
            SessionParams::Local(_) => Err(SessionError::WrongKind(self.id.to_string())),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionState::Failed)
    }

    /// Move to a new state and publish it.
    ///
    /// `Closed` is final; a session that closed stays closed.
    pub fn set_state(&self, next: SessionState) {
        let changed = match self.state.lock() {
            Ok(mut state) => {
                if *state == next || *state == SessionState::Closed {
                    false
                } else {
                    *state = next;
                    true
                }
            }
            Err(_) => false,
        };
        if changed {
            self.publish(next);
        }
    }

    fn publish(&self, state: SessionState) {
        tracing::debug!("Session {} is {}", self.id, state);
        self.events.emit(CoreEvent::Session(SessionEvent::State {
            session_id: self.id.clone(),
            state,
        }));
    }

    /// Number of the next channel to be opened
    pub fn channel_watermark(&self) -> u32 {
        self.next_channel.load(Ordering::SeqCst)
    }

    /// Attach the authenticated transport and become `Ready`.
    ///
    /// Returns `false` (and closes the transport) if the session was closed
    /// while connecting.
    pub async fn attach_transport(self: &Arc<Self>, transport: Arc<Transport>) -> bool {
        if self.state() == SessionState::Closed {
            transport.close().await;
            return false;
        }
        if let Ok(mut slot) = self.transport.write() {
            *slot = Some(transport.clone());
        }
        self.set_state(SessionState::Ready);

        // Mark the session failed when the transport goes away unasked.
        let token = transport.closed_token();
        let transport = Arc::downgrade(&transport);
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            token.cancelled().await;
            let failed = transport.upgrade().map(|t| t.has_failed()).unwrap_or(false);
            if let Some(session) = session.upgrade() {
                if failed {
                    tracing::warn!("Session {} lost its transport", session.id);
                    session.set_state(SessionState::Failed);
                }
            }
        });
        true
    }

    /// Mark a local session ready with the shell it runs
    pub fn attach_local(&self, shell: &str) {
        if let Ok(mut target) = self.target.write() {
            *target = shell.to_string();
        }
        self.set_state(SessionState::Ready);
    }

    /// The session's transport
    pub fn transport(&self) -> Result<Arc<Transport>, CoreError> {
        if self.kind() == SessionKind::Local {
            return Err(SessionError::WrongKind(self.id.to_string()).into());
        }
        let transport = self
            .transport
            .read()
            .ok()
            .and_then(|t| t.clone())
            .ok_or_else(|| SessionError::Connecting(self.id.to_string()))?;
        if transport.is_closed() {
            return Err(TransportError::Closed.into());
        }
        Ok(transport)
    }

    /// Serve a newly opened link channel under this session.
    ///
    /// Exec channels are renumbered to `exec:<channel number>`.
    pub fn add_channel(
        self: &Arc<Self>,
        purpose: ChannelPurpose,
        link: LinkChannel,
        slot: Option<ChannelSlot>,
    ) -> Arc<ChannelHandle> {
        let local = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let purpose = match purpose {
            ChannelPurpose::Exec(_) => ChannelPurpose::Exec(local),
            other => other,
        };
        let id = ChannelId::new(self.id.clone(), local);
        let parent = match self.transport.read().ok().and_then(|t| t.clone()) {
            Some(transport) => transport.closed_token(),
            None => self.local_closed.clone(),
        };

        let session = Arc::downgrade(self);
        let handle = ChannelHandle::spawn(
            id,
            purpose,
            link,
            slot,
            &parent,
            self.options,
            Box::new(move |id, cause| Session::channel_closed(&session, id, cause)),
        );
        self.channels.insert(local, handle.clone());
        if handle.is_closed() {
            self.channels.remove(&local);
        }

        if self.state() == SessionState::Degraded {
            self.set_state(SessionState::Ready);
        }
        handle
    }

    fn channel_closed(session: &Weak<Session>, id: &ChannelId, cause: CloseCause) {
        let Some(session) = session.upgrade() else {
            return;
        };
        session.channels.remove(&id.local);

        if session.kind() == SessionKind::Local {
            // The local shell is the whole session.
            session.set_state(SessionState::Closed);
            session.local_closed.cancel();
            return;
        }
        if cause == (CloseCause::Remote { clean: false }) {
            let alive = session
                .transport
                .read()
                .ok()
                .and_then(|t| t.clone())
                .map(|t| !t.is_closed())
                .unwrap_or(false);
            if alive && !session.state().is_terminal() {
                tracing::warn!("Channel {} closed unexpectedly", id);
                session.set_state(SessionState::Degraded);
            }
        }
    }

    /// Look up an open channel by number
    pub fn channel(&self, local: u32) -> Result<Arc<ChannelHandle>, ChannelError> {
        let id = ChannelId::new(self.id.clone(), local);
        if let Some(handle) = self.channels.get(&local) {
            if handle.is_closed() {
                return Err(ChannelError::Closed(id.to_string()));
            }
            return Ok(handle.clone());
        }
        // Numbers below the watermark were handed out and have since closed.
        if local < self.channel_watermark() || self.state().is_terminal() {
            return Err(ChannelError::Closed(id.to_string()));
        }
        Err(ChannelError::NotFound(id.to_string()))
    }

    /// Open channel with this purpose, if any
    pub fn channel_by_purpose(&self, purpose: ChannelPurpose) -> Option<Arc<ChannelHandle>> {
        self.channels
            .iter()
            .find(|c| c.purpose() == purpose && !c.is_closed())
            .map(|c| c.clone())
    }

    /// The session's SFTP channel, opened on first use
    pub async fn sftp(
        &self,
        factory: &dyn RemoteFsFactory,
        tasks: &Arc<TaskRegistry>,
        config: &CoreConfig,
    ) -> Result<Arc<SftpChannel>, CoreError> {
        let transport = self.transport()?;
        let mut slot = self.sftp.lock().await;
        if let Some(channel) = slot.as_ref() {
            return Ok(channel.clone());
        }

        tracing::debug!("Opening SFTP channel for {}", self.id);
        let (stream, channel_slot) = transport
            .open_stream(StreamRequest::Subsystem("sftp".to_string()))
            .await?;
        let fs = factory.open(stream).await?;
        let channel = Arc::new(SftpChannel::new(
            self.id.clone(),
            fs,
            Some(channel_slot),
            self.events.clone(),
            tasks.clone(),
            config,
        ));
        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// Whether the SFTP channel is open
    pub fn has_sftp(&self) -> bool {
        self.sftp
            .try_lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
            && self.transport().is_ok()
    }

    /// Listing entry
    pub fn info(&self) -> SessionInfo {
        let mut channels: Vec<ChannelSummary> = self
            .channels
            .iter()
            .filter(|c| !c.is_closed())
            .map(|c| ChannelSummary {
                channel_id: c.id().clone(),
                purpose: c.purpose().to_string(),
            })
            .collect();
        channels.sort_by_key(|c| c.channel_id.local);
        if self.has_sftp() {
            channels.push(ChannelSummary {
                channel_id: ChannelId::new(self.id.clone(), 0),
                purpose: ChannelPurpose::Sftp.to_string(),
            });
        }

        SessionInfo {
            id: self.id.clone(),
            kind: self.kind(),
            state: self.state(),
            target: self.target.read().map(|t| t.clone()).unwrap_or_default(),
            channels,
        }
    }

    /// Number of hops the session's transport chain has
    pub fn hop_count(&self) -> usize {
        match &self.params {
            SessionParams::Remote(params) => params.jump_chain.len() + 1,
            SessionParams::Local(_) => 1,
        }
    }

    /// Close every channel, then the transport. Idempotent.
    pub async fn close(&self) {
        self.set_state(SessionState::Closed);

        let channels: Vec<_> = self.channels.iter().map(|c| c.clone()).collect();
        for channel in channels {
            channel.close();
        }
        self.local_closed.cancel();

        if let Some(sftp) = self.sftp.lock().await.take() {
            sftp.close().await;
        }

        let transport = self.transport.write().ok().and_then(|mut t| t.take());
        if let Some(transport) = transport {
            transport.close().await;
        }
        tracing::info!("Session {} closed", self.id);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl AuthObserver for Session {
    fn awaiting_user(&self, waiting: bool) {
        let state = self.state();
        if state.is_terminal() || state == SessionState::Ready {
            return;
        }
        self.set_state(if waiting {
            SessionState::AuthPending
        } else {
            SessionState::Connecting
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_session(events: &EventBus) -> Arc<Session> {
        Session::new(
            SessionId::new("tab-1"),
            SessionParams::Local(LocalShellParams::default()),
            events.clone(),
            ChannelOptions::default(),
            1,
        )
    }

    #[tokio::test]
    async fn test_state_changes_are_published() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let session = local_session(&events);

        session.awaiting_user(true);
        session.awaiting_user(false);
        session.attach_local("/bin/sh");

        let mut states = Vec::new();
        while let Ok(CoreEvent::Session(SessionEvent::State { state, .. })) = rx.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            [
                SessionState::Connecting,
                SessionState::AuthPending,
                SessionState::Connecting,
                SessionState::Ready
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_is_final() {
        let session = local_session(&EventBus::new());
        session.close().await;
        session.set_state(SessionState::Ready);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_unknown_and_stale_channel_numbers() {
        let session = Session::new(
            SessionId::new("tab-1"),
            SessionParams::Local(LocalShellParams::default()),
            EventBus::new(),
            ChannelOptions::default(),
            5,
        );
        assert_eq!(session.channel(3).unwrap_err().code(), "ChannelClosed");
        assert_eq!(session.channel(5).unwrap_err().code(), "ChannelNotFound");
    }

    #[tokio::test]
    async fn test_debug_shows_id_and_state() {
        let session = local_session(&EventBus::new());
        let shown = format!("{:?}", session);
        assert!(shown.contains(session.id().as_str()));
        assert!(shown.contains("Connecting"));
    }

    #[tokio::test]
    async fn test_local_session_has_no_transport() {
        let session = local_session(&EventBus::new());
        let err = session.transport().unwrap_err();
        assert_eq!(err.code(), "WrongSessionKind");
    }
}
