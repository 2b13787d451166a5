//! Session hub
//!
//! The caller-facing facade of the core: connect and disconnect, shell and
//! exec channels, the keyboard-interactive and account-selection exchanges,
//! SFTP operations and local shells. A hub is a plain value; tests create as
//! many as they like.

use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use tl_core::config::CoreConfig;
use tl_core::error::{ChannelError, CoreError, SessionError};
use tl_core::traits::{ChannelRequest, Connector, RemoteFsFactory};
use tl_core::types::{ChannelPurpose, ConnectionParams, LocalShellParams, SessionKind, SessionState};
use tl_protocol::{
    AgentKeyInfo, ChallengeId, ChannelId, CoreEvent, FileRecord, SelectionId, SessionId, SessionInfo,
    ShellEvent, TaskKey, TerminalSize, TransferOutcome,
};

use crate::agent::AgentManager;
use crate::auth::AuthCoordinator;
use crate::backoff::ReconnectSchedule;
use crate::channel::ChannelOptions;
use crate::events::EventBus;
use crate::jump::{ChainResolver, JumpChainPlan};
use crate::mux::ChannelMux;
use crate::pty;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionParams};
use crate::sftp::{RusshFsFactory, SftpChannel, TaskRegistry};
use crate::transport::ssh::RusshConnector;
use crate::transport::HealthWatch;

/// Collected result of a one-shot command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<u32>,
}

/// Orchestrates every session of one client
pub struct SessionHub {
    config: CoreConfig,
    connector: Arc<dyn Connector>,
    fs_factory: Arc<dyn RemoteFsFactory>,
    events: EventBus,
    agent: Arc<AgentManager>,
    coordinator: AuthCoordinator,
    registry: Arc<SessionRegistry>,
    mux: ChannelMux,
    tasks: Arc<TaskRegistry>,
    health: HealthWatch,
}

impl SessionHub {
    /// Create a hub over the given backends, with the SSH agent the
    /// configuration names
    pub fn new(
        config: CoreConfig,
        connector: Arc<dyn Connector>,
        fs_factory: Arc<dyn RemoteFsFactory>,
    ) -> Self {
        let agent = AgentManager::from_config(&config.agent);
        Self::with_agent(config, connector, fs_factory, agent)
    }

    /// Create a hub over the given backends and agent
    pub fn with_agent(
        config: CoreConfig,
        connector: Arc<dyn Connector>,
        fs_factory: Arc<dyn RemoteFsFactory>,
        agent: AgentManager,
    ) -> Self {
        let events = EventBus::new();
        let agent = Arc::new(agent);
        let coordinator = AuthCoordinator::new(
            events.clone(),
            config.challenge_timeout,
            config.selection_timeout,
            agent.clone(),
        );
        let registry = Arc::new(SessionRegistry::new());

        Self {
            health: HealthWatch::new(config.health_check_interval),
            mux: ChannelMux::new(registry.clone()),
            tasks: Arc::new(TaskRegistry::new()),
            config,
            connector,
            fs_factory,
            events,
            agent,
            coordinator,
            registry,
        }
    }

    /// Create a hub backed by russh
    pub fn with_russh(config: CoreConfig) -> Self {
        Self::new(
            config,
            Arc::new(RusshConnector::new()),
            Arc::new(RusshFsFactory),
        )
    }

    /// Subscribe to auth, selection, SFTP and lifecycle events
    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Configuration in use
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The channel multiplexer
    pub fn mux(&self) -> &ChannelMux {
        &self.mux
    }

    /// The session registry
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn session(&self, id: &SessionId) -> Result<Arc<Session>, SessionError> {
        self.registry
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    fn channel_options(&self) -> ChannelOptions {
        ChannelOptions::from_config(&self.config)
    }

    // ----- Connection lifecycle -----

    /// Open a remote session.
    ///
    /// Connecting an id that is already up with the same parameters is a
    /// no-op; different parameters are refused.
    pub async fn connect(
        &self,
        session_id: SessionId,
        params: ConnectionParams,
    ) -> Result<(), CoreError> {
        if let Some(existing) = self.registry.get(&session_id) {
            let same = matches!(existing.params(), SessionParams::Remote(p) if *p == params);
            match existing.state() {
                SessionState::Connecting | SessionState::AuthPending => {
                    return Err(SessionError::Connecting(session_id.to_string()).into());
                }
                SessionState::Ready | SessionState::Degraded if same => return Ok(()),
                SessionState::Ready | SessionState::Degraded => {
                    return Err(SessionError::AlreadyExists(session_id.to_string()).into());
                }
                SessionState::Closed | SessionState::Failed => {}
            }
        }

        tracing::info!("Connecting {} to {}", session_id, params.display_target());
        let session = self.new_session(session_id, SessionParams::Remote(params))?;
        self.establish(&session).await
    }

    fn new_session(
        &self,
        session_id: SessionId,
        params: SessionParams,
    ) -> Result<Arc<Session>, CoreError> {
        let first_channel = self.registry.next_channel_number(&session_id);
        let session = Session::new(
            session_id.clone(),
            params,
            self.events.clone(),
            self.channel_options(),
            first_channel,
        );
        self.registry.register(session.clone()).map_err(|existing| {
            if existing.state() == SessionState::Ready || existing.state() == SessionState::Degraded
            {
                SessionError::AlreadyExists(session_id.to_string())
            } else {
                SessionError::Connecting(session_id.to_string())
            }
        })?;
        Ok(session)
    }

    async fn establish(&self, session: &Arc<Session>) -> Result<(), CoreError> {
        let params = session.remote_params()?;
        let plan = JumpChainPlan::from_params(session.id().clone(), params);
        let resolver = ChainResolver::new(
            self.connector.as_ref(),
            &self.coordinator,
            &self.events,
            self.config.connect_timeout,
            self.config.max_channels_per_session,
        );

        match resolver.resolve(plan, session.as_ref()).await {
            Ok(transport) => {
                self.health.spawn_watch(Arc::downgrade(&transport));
                if !session.attach_transport(transport).await {
                    tracing::info!("Session {} was closed while connecting", session.id());
                    return Err(SessionError::NotFound(session.id().to_string()).into());
                }
                tracing::info!("Session {} ready", session.id());
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Connecting {} failed: {}", session.id(), e);
                session.set_state(SessionState::Failed);
                self.registry.remove_if_same(session);
                Err(e.into())
            }
        }
    }

    /// Re-run connect with the session's stored parameters.
    ///
    /// Retries with exponential backoff; stops at once on errors retrying
    /// cannot fix (rejected credentials or host key).
    pub async fn reconnect(&self, session_id: &SessionId) -> Result<(), CoreError> {
        let existing = self.session(session_id)?;
        let params = existing.remote_params()?.clone();
        if matches!(
            existing.state(),
            SessionState::Connecting | SessionState::AuthPending
        ) {
            return Err(SessionError::Connecting(session_id.to_string()).into());
        }

        tracing::info!("Reconnecting {}", session_id);
        self.coordinator
            .cancel_session(session_id, existing.hop_count());
        existing.close().await;

        let mut schedule =
            ReconnectSchedule::from_config(&self.config.backoff, self.config.reconnect_attempts);
        let mut last_error = None;

        while let Some(delay) = schedule.next_delay() {
            if !delay.is_zero() {
                tracing::info!(
                    "Retrying {} in {:?} ({} attempts left)",
                    session_id,
                    delay,
                    schedule.remaining()
                );
                tokio::time::sleep(delay).await;
            }

            let session =
                self.new_session(session_id.clone(), SessionParams::Remote(params.clone()))?;
            match self.establish(&session).await {
                Ok(()) => return Ok(()),
                Err(e) if is_permanent(&e) => return Err(e),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| SessionError::NotFound(session_id.to_string()).into()))
    }

    /// Close a session and everything on it. Unknown ids are fine.
    pub async fn disconnect(&self, session_id: &SessionId) {
        let Some(session) = self.registry.remove(session_id) else {
            tracing::debug!("Disconnect of unknown session {}", session_id);
            return;
        };
        tracing::info!("Disconnecting {}", session_id);
        self.coordinator
            .cancel_session(session_id, session.hop_count());
        session.close().await;
    }

    /// Close every session
    pub async fn shutdown(&self) {
        for session in self.registry.list() {
            self.disconnect(session.id()).await;
        }
    }

    /// All sessions
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list().iter().map(|s| s.info()).collect()
    }

    // ----- Shell and exec -----

    /// The session's shell channel, opened on first use
    pub async fn shell(
        &self,
        session_id: &SessionId,
        size: Option<TerminalSize>,
    ) -> Result<ChannelId, CoreError> {
        let session = self.session(session_id)?;
        let _opening = session.lock_shell().await;
        if let Some(shell) = session.channel_by_purpose(ChannelPurpose::Shell) {
            return Ok(shell.id().clone());
        }
        if session.kind() == SessionKind::Local {
            return Err(ChannelError::Closed(format!("{}/shell", session_id)).into());
        }

        let transport = session.transport()?;
        let (link, slot) = transport
            .open_channel(ChannelRequest::Shell {
                term: self.config.default_term.clone(),
                size: size.unwrap_or_default(),
            })
            .await?;
        let shell = session.add_channel(ChannelPurpose::Shell, link, Some(slot));
        tracing::info!("Shell {} opened", shell.id());
        Ok(shell.id().clone())
    }

    /// Register a consumer on a channel
    pub fn subscribe(&self, channel_id: &ChannelId) -> Result<mpsc::Receiver<ShellEvent>, CoreError> {
        Ok(self.mux.subscribe(channel_id)?)
    }

    /// Send bytes to a channel
    pub async fn write(&self, channel_id: &ChannelId, data: Bytes) -> Result<(), CoreError> {
        Ok(self.mux.write(channel_id, data).await?)
    }

    /// Resize a shell channel
    pub async fn resize(&self, channel_id: &ChannelId, size: TerminalSize) -> Result<(), CoreError> {
        Ok(self.mux.resize(channel_id, size).await?)
    }

    /// Close one channel
    pub fn close_channel(&self, channel_id: &ChannelId) -> Result<(), CoreError> {
        Ok(self.mux.close_channel(channel_id)?)
    }

    /// Run a command and collect its output
    pub async fn exec(&self, session_id: &SessionId, command: &str) -> Result<ExecOutput, CoreError> {
        let session = self.session(session_id)?;
        let transport = session.transport()?;

        tracing::debug!("Exec on {}: {}", session_id, command);
        let (link, slot) = transport
            .open_channel(ChannelRequest::Exec {
                command: command.to_string(),
            })
            .await?;
        let channel = session.add_channel(ChannelPurpose::Exec(0), link, Some(slot));
        let mut events = channel.subscribe();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(event) = events.recv().await {
            match event {
                ShellEvent::Data { data, .. } => stdout.extend_from_slice(&data),
                ShellEvent::Stderr { data, .. } => stderr.extend_from_slice(&data),
                ShellEvent::Close { exit_code: code, .. } => {
                    exit_code = code;
                    break;
                }
            }
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    // ----- Keyboard-interactive and account selection -----

    /// Answer a keyboard-interactive challenge
    pub fn respond_challenge(
        &self,
        challenge_id: &ChallengeId,
        answers: Vec<String>,
    ) -> Result<(), CoreError> {
        Ok(self.coordinator.respond(challenge_id, answers)?)
    }

    /// Cancel a keyboard-interactive challenge
    pub fn cancel_challenge(&self, challenge_id: &ChallengeId) -> Result<(), CoreError> {
        Ok(self.coordinator.cancel(challenge_id)?)
    }

    /// Pick the target account behind a jump server
    pub fn respond_selection(
        &self,
        selection_id: &SelectionId,
        account_id: String,
    ) -> Result<(), CoreError> {
        Ok(self.coordinator.respond_selection(selection_id, account_id)?)
    }

    /// Cancel an account selection
    pub fn cancel_selection(&self, selection_id: &SelectionId) -> Result<(), CoreError> {
        Ok(self.coordinator.cancel_selection(selection_id)?)
    }

    // ----- SSH agent -----

    /// Switch agent authentication and key management on or off
    pub async fn agent_configure(&self, enabled: bool) -> Result<(), CoreError> {
        Ok(self.agent.configure(enabled).await?)
    }

    /// Whether the agent is switched on
    pub fn agent_enabled(&self) -> bool {
        self.agent.is_enabled()
    }

    /// Load a private key into the agent
    pub async fn agent_add_key(
        &self,
        private_key: &str,
        passphrase: Option<&str>,
        comment: Option<&str>,
    ) -> Result<AgentKeyInfo, CoreError> {
        Ok(self.agent.add_key(private_key, passphrase, comment).await?)
    }

    /// Remove a key from the agent by fingerprint
    pub async fn agent_remove_key(&self, key_id: &str) -> Result<(), CoreError> {
        Ok(self.agent.remove_key(key_id).await?)
    }

    /// Keys the agent holds
    pub async fn agent_list_keys(&self) -> Result<Vec<AgentKeyInfo>, CoreError> {
        Ok(self.agent.list_keys().await?)
    }

    // ----- SFTP -----

    async fn sftp(&self, session_id: &SessionId) -> Result<Arc<SftpChannel>, CoreError> {
        self.session(session_id)?
            .sftp(self.fs_factory.as_ref(), &self.tasks, &self.config)
            .await
    }

    /// List a remote directory
    pub async fn sftp_list(
        &self,
        session_id: &SessionId,
        path: &str,
    ) -> Result<Vec<FileRecord>, CoreError> {
        Ok(self.sftp(session_id).await?.list(path).await?)
    }

    /// Upload one file
    pub async fn sftp_upload_file(
        &self,
        session_id: &SessionId,
        local_path: &Path,
        remote_path: &str,
        task_key: Option<TaskKey>,
    ) -> Result<(TaskKey, TransferOutcome), CoreError> {
        let key = task_key.unwrap_or_else(TaskKey::generate);
        let sftp = self.sftp(session_id).await?;
        let outcome = sftp.upload_file(local_path, remote_path, key.clone()).await?;
        Ok((key, outcome))
    }

    /// Upload a directory tree
    pub async fn sftp_upload_directory(
        &self,
        session_id: &SessionId,
        local_dir: &Path,
        remote_dir: &str,
        task_key: Option<TaskKey>,
    ) -> Result<(TaskKey, TransferOutcome), CoreError> {
        let key = task_key.unwrap_or_else(TaskKey::generate);
        let sftp = self.sftp(session_id).await?;
        let outcome = sftp
            .upload_directory(local_dir, remote_dir, key.clone())
            .await?;
        Ok((key, outcome))
    }

    /// Download one file
    pub async fn sftp_download_file(
        &self,
        session_id: &SessionId,
        remote_path: &str,
        local_path: &Path,
        task_key: Option<TaskKey>,
    ) -> Result<(TaskKey, TransferOutcome), CoreError> {
        let key = task_key.unwrap_or_else(TaskKey::generate);
        let sftp = self.sftp(session_id).await?;
        let outcome = sftp
            .download_file(remote_path, local_path, key.clone())
            .await?;
        Ok((key, outcome))
    }

    /// Rename or move a remote path
    pub async fn sftp_rename(
        &self,
        session_id: &SessionId,
        from: &str,
        to: &str,
    ) -> Result<(), CoreError> {
        Ok(self.sftp(session_id).await?.rename(from, to).await?)
    }

    /// Delete a remote file or directory tree
    pub async fn sftp_delete(&self, session_id: &SessionId, path: &str) -> Result<(), CoreError> {
        Ok(self.sftp(session_id).await?.delete(path).await?)
    }

    /// Change permission bits
    pub async fn sftp_chmod(
        &self,
        session_id: &SessionId,
        path: &str,
        mode: u32,
        recursive: bool,
    ) -> Result<(), CoreError> {
        Ok(self
            .sftp(session_id)
            .await?
            .chmod(path, mode, recursive)
            .await?)
    }

    /// Cancel a running transfer. Returns `false` if it already finished.
    pub fn cancel_task(&self, task_key: &TaskKey) -> bool {
        self.tasks.cancel(task_key)
    }

    /// Whether SFTP works on a session, opening the channel if needed
    pub async fn sftp_available(&self, session_id: &SessionId) -> bool {
        match self.sftp(session_id).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("SFTP unavailable on {}: {}", session_id, e);
                false
            }
        }
    }

    /// Sessions with an open SFTP channel
    pub fn sftp_sessions(&self) -> Vec<SessionId> {
        self.registry
            .list()
            .iter()
            .filter(|s| s.has_sftp())
            .map(|s| s.id().clone())
            .collect()
    }

    // ----- Local shells -----

    /// Start a local shell session, returning its id and shell channel
    pub async fn connect_local(
        &self,
        session_id: Option<SessionId>,
        params: LocalShellParams,
    ) -> Result<(SessionId, ChannelId), CoreError> {
        let session_id = session_id.unwrap_or_else(SessionId::generate);
        if let Some(existing) = self.registry.get(&session_id) {
            if !existing.state().is_terminal() {
                return Err(SessionError::AlreadyExists(session_id.to_string()).into());
            }
        }

        let session = self.new_session(session_id.clone(), SessionParams::Local(params.clone()))?;
        let shell = match pty::spawn_local(&params, &self.config.default_term) {
            Ok(shell) => shell,
            Err(e) => {
                tracing::warn!("Local shell for {} failed: {}", session_id, e);
                session.set_state(SessionState::Failed);
                self.registry.remove_if_same(&session);
                return Err(e.into());
            }
        };

        session.attach_local(&shell.shell);
        let channel = session.add_channel(ChannelPurpose::Shell, shell.channel, None);
        tracing::info!("Local session {} running {} ({:?})", session_id, shell.shell, shell.pid);
        Ok((session_id, channel.id().clone()))
    }

    /// Local shells that may be started
    pub fn available_shells(&self) -> Vec<String> {
        pty::available_shells()
    }
}

fn is_permanent(e: &CoreError) -> bool {
    match e {
        CoreError::Transport(e) => e.is_permanent(),
        _ => false,
    }
}
