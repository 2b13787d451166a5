//! russh-backed links
//!
//! Each opened channel is owned by a small task that multiplexes inbound
//! channel messages and outbound commands, so callers only ever hold a
//! cloneable command sender.

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Config, Handle, KeyboardInteractiveAuthResponse, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

use tl_core::error::{ChannelError, TransportError};
use tl_core::traits::{
    BoxedStream, ChannelControl, ChannelInput, ChannelRequest, Connector, HostTarget,
    KeyboardInteractiveReply, LinkChannel, SshLink, StreamRequest,
};
use tl_protocol::{Prompt, TerminalSize};

/// Inbound items buffered per channel between the channel task and the
/// demultiplexer.
const CHANNEL_INBOUND_CAPACITY: usize = 256;

/// Commands buffered per channel task
const CHANNEL_COMMAND_CAPACITY: usize = 64;

/// Creates russh client connections
pub struct RusshConnector {
    config: Arc<Config>,
}

impl RusshConnector {
    /// Create a connector with default client settings
    pub fn new() -> Self {
        Self {
            config: Arc::new(Config::default()),
        }
    }

    /// Create a connector with custom client settings
    pub fn with_config(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(&self, target: &HostTarget) -> Result<Box<dyn SshLink>, TransportError> {
        let (handler, rejected) = ClientHandler::new(target);
        let handle = client::connect(
            self.config.clone(),
            (target.host.as_str(), target.port),
            handler,
        )
        .await
        .map_err(|e| map_connect_error(e, target, &rejected))?;

        tracing::debug!("SSH handshake with {} complete", target.address());
        Ok(Box::new(RusshLink::new(handle, target)))
    }

    async fn connect_over(
        &self,
        stream: BoxedStream,
        target: &HostTarget,
    ) -> Result<Box<dyn SshLink>, TransportError> {
        let (handler, rejected) = ClientHandler::new(target);
        let handle = client::connect_stream(self.config.clone(), stream, handler)
            .await
            .map_err(|e| map_connect_error(e, target, &rejected))?;

        tracing::debug!("Tunneled SSH handshake with {} complete", target.address());
        Ok(Box::new(RusshLink::new(handle, target)))
    }
}

fn map_connect_error(
    error: russh::Error,
    target: &HostTarget,
    rejected: &Mutex<Option<String>>,
) -> TransportError {
    let rejected_key = rejected.lock().ok().and_then(|mut r| r.take());
    if let Some(fingerprint) = rejected_key {
        return TransportError::HostKeyRejected {
            host: target.host.clone(),
            fingerprint,
        };
    }
    match error {
        russh::Error::IO(e) => {
            TransportError::NetworkUnreachable(format!("{}: {}", target.address(), e))
        }
        russh::Error::UnknownKey => TransportError::HostKeyRejected {
            host: target.host.clone(),
            fingerprint: "unknown".to_string(),
        },
        other => TransportError::HandshakeFailed(format!("{}: {}", target.address(), other)),
    }
}

/// SSH client handler: verifies the server key against a pinned fingerprint
struct ClientHandler {
    /// Host name for logs
    host: String,
    /// Expected fingerprint, without the `SHA256:` prefix
    expected: Option<String>,
    /// Fingerprint of a rejected key, for the error report
    rejected: Arc<Mutex<Option<String>>>,
}

impl ClientHandler {
    fn new(target: &HostTarget) -> (Self, Arc<Mutex<Option<String>>>) {
        let rejected = Arc::new(Mutex::new(None));
        let handler = Self {
            host: target.host.clone(),
            expected: target
                .host_key_fingerprint
                .as_deref()
                .map(normalize_fingerprint),
            rejected: rejected.clone(),
        };
        (handler, rejected)
    }
}

fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .trim()
        .trim_start_matches("SHA256:")
        .trim_end_matches('=')
        .to_string()
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Server host key for {}: SHA256:{}", self.host, fingerprint);

        match &self.expected {
            Some(expected) if normalize_fingerprint(&fingerprint) != *expected => {
                tracing::warn!(
                    "Host key mismatch for {}: expected SHA256:{}, got SHA256:{}",
                    self.host,
                    expected,
                    fingerprint
                );
                if let Ok(mut rejected) = self.rejected.lock() {
                    *rejected = Some(format!("SHA256:{}", fingerprint));
                }
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}

/// A russh client connection
pub struct RusshLink {
    handle: Handle<ClientHandler>,
    label: String,
}

impl RusshLink {
    fn new(handle: Handle<ClientHandler>, target: &HostTarget) -> Self {
        Self {
            handle,
            label: target.address(),
        }
    }

    async fn open_session(&self) -> Result<Channel<Msg>, TransportError> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| self.map_channel_error(e))
    }

    fn map_channel_error(&self, error: russh::Error) -> TransportError {
        if self.handle.is_closed() {
            TransportError::Closed
        } else {
            TransportError::RemoteRejected(format!("{}: {}", self.label, error))
        }
    }
}

#[async_trait]
impl SshLink for RusshLink {
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<bool, TransportError> {
        self.handle
            .authenticate_password(user, password)
            .await
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> Result<bool, TransportError> {
        let key = match russh_keys::decode_secret_key(private_key, passphrase) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("Cannot decode private key for {}: {}", self.label, e);
                return Ok(false);
            }
        };
        self.handle
            .authenticate_publickey(user, Arc::new(key))
            .await
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))
    }

    #[cfg(unix)]
    async fn auth_agent(&mut self, user: &str, socket: &Path) -> Result<bool, TransportError> {
        use russh_keys::agent::client::AgentClient;

        let mut agent = match AgentClient::connect_uds(socket).await {
            Ok(agent) => agent,
            Err(e) => {
                tracing::warn!("Cannot reach SSH agent at {}: {}", socket.display(), e);
                return Ok(false);
            }
        };
        let keys = match agent.request_identities().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("SSH agent did not list its keys: {}", e);
                return Ok(false);
            }
        };

        for key in keys {
            let fingerprint = key.fingerprint();
            let (returned, result) = self.handle.authenticate_future(user, key, agent).await;
            agent = returned;
            match result {
                Ok(true) => {
                    tracing::debug!("{} accepted agent key SHA256:{}", self.label, fingerprint);
                    return Ok(true);
                }
                Ok(false) => continue,
                Err(e) => return Err(TransportError::HandshakeFailed(e.to_string())),
            }
        }
        Ok(false)
    }

    #[cfg(not(unix))]
    async fn auth_agent(&mut self, _user: &str, socket: &Path) -> Result<bool, TransportError> {
        tracing::warn!("SSH agent at {} needs a Unix socket", socket.display());
        Ok(false)
    }

    async fn auth_keyboard_interactive_start(
        &mut self,
        user: &str,
    ) -> Result<KeyboardInteractiveReply, TransportError> {
        let response = self
            .handle
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
        Ok(convert_reply(response))
    }

    async fn auth_keyboard_interactive_respond(
        &mut self,
        answers: Vec<String>,
    ) -> Result<KeyboardInteractiveReply, TransportError> {
        let response = self
            .handle
            .authenticate_keyboard_interactive_respond(answers)
            .await
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
        Ok(convert_reply(response))
    }

    async fn open_channel(&self, request: ChannelRequest) -> Result<LinkChannel, TransportError> {
        let channel = self.open_session().await?;

        match &request {
            ChannelRequest::Shell { term, size } => {
                channel
                    .request_pty(true, term, size.cols as u32, size.rows as u32, 0, 0, &[])
                    .await
                    .map_err(|e| self.map_channel_error(e))?;
                channel
                    .request_shell(true)
                    .await
                    .map_err(|e| self.map_channel_error(e))?;
            }
            ChannelRequest::Exec { command } => {
                channel
                    .exec(true, command.as_bytes())
                    .await
                    .map_err(|e| self.map_channel_error(e))?;
            }
        }

        tracing::debug!("Opened {:?} channel on {}", request, self.label);
        Ok(spawn_channel_task(channel))
    }

    async fn open_stream(&self, request: StreamRequest) -> Result<BoxedStream, TransportError> {
        let channel = match &request {
            StreamRequest::Subsystem(name) => {
                let channel = self.open_session().await?;
                channel
                    .request_subsystem(true, name)
                    .await
                    .map_err(|e| self.map_channel_error(e))?;
                channel
            }
            StreamRequest::DirectTcpip { host, port } => self
                .handle
                .channel_open_direct_tcpip(host.as_str(), *port as u32, "127.0.0.1", 0)
                .await
                .map_err(|e| self.map_channel_error(e))?,
        };

        tracing::debug!("Opened {:?} stream on {}", request, self.label);
        Ok(Box::new(channel.into_stream()))
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("Disconnect from {}: {}", self.label, e);
        }
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

fn convert_reply(response: KeyboardInteractiveAuthResponse) -> KeyboardInteractiveReply {
    match response {
        KeyboardInteractiveAuthResponse::Success => KeyboardInteractiveReply::Success,
        KeyboardInteractiveAuthResponse::Failure { .. } => KeyboardInteractiveReply::Failure,
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
            ..
        } => KeyboardInteractiveReply::Prompts {
            name,
            instructions,
            prompts: prompts
                .into_iter()
                .map(|p| Prompt::new(p.prompt, p.echo))
                .collect(),
        },
    }
}

/// Commands for a channel task
enum ChannelCommand {
    Write(Bytes, oneshot::Sender<Result<(), ChannelError>>),
    Resize(TerminalSize, oneshot::Sender<Result<(), ChannelError>>),
    Eof,
    Close,
}

/// Outbound half handed to the multiplexer
struct RusshChannelControl {
    commands: mpsc::Sender<ChannelCommand>,
}

impl RusshChannelControl {
    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), ChannelError>>) -> ChannelCommand,
    ) -> Result<(), ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ChannelError::Closed("channel task ended".to_string()))?;
        rx.await
            .map_err(|_| ChannelError::Closed("channel task ended".to_string()))?
    }
}

#[async_trait]
impl ChannelControl for RusshChannelControl {
    async fn write(&self, data: Bytes) -> Result<(), ChannelError> {
        self.request(|ack| ChannelCommand::Write(data, ack)).await
    }

    async fn resize(&self, size: TerminalSize) -> Result<(), ChannelError> {
        self.request(|ack| ChannelCommand::Resize(size, ack)).await
    }

    async fn eof(&self) -> Result<(), ChannelError> {
        let _ = self.commands.send(ChannelCommand::Eof).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let _ = self.commands.send(ChannelCommand::Close).await;
        Ok(())
    }
}

fn spawn_channel_task(channel: Channel<Msg>) -> LinkChannel {
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_INBOUND_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(CHANNEL_COMMAND_CAPACITY);

    tokio::spawn(run_channel(channel, command_rx, inbound_tx));

    LinkChannel {
        inbound: inbound_rx,
        control: Arc::new(RusshChannelControl {
            commands: command_tx,
        }),
    }
}

async fn run_channel(
    mut channel: Channel<Msg>,
    mut commands: mpsc::Receiver<ChannelCommand>,
    inbound: mpsc::Sender<ChannelInput>,
) {
    let id = channel.id();

    loop {
        tokio::select! {
            msg = channel.wait() => {
                let input = match msg {
                    Some(ChannelMsg::Data { data }) => {
                        ChannelInput::Data(Bytes::copy_from_slice(&data))
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        ChannelInput::Stderr(Bytes::copy_from_slice(&data))
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        ChannelInput::ExitStatus(exit_status)
                    }
                    Some(ChannelMsg::Eof) => ChannelInput::Eof,
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => continue,
                };
                if inbound.send(input).await.is_err() {
                    let _ = channel.close().await;
                    break;
                }
            }
            cmd = commands.recv() => match cmd {
                Some(ChannelCommand::Write(data, ack)) => {
                    let result = channel
                        .data(&data[..])
                        .await
                        .map_err(|e| ChannelError::Closed(e.to_string()));
                    let _ = ack.send(result);
                }
                Some(ChannelCommand::Resize(size, ack)) => {
                    let result = channel
                        .window_change(size.cols as u32, size.rows as u32, 0, 0)
                        .await
                        .map_err(|e| ChannelError::Closed(e.to_string()));
                    let _ = ack.send(result);
                }
                Some(ChannelCommand::Eof) => {
                    let _ = channel.eof().await;
                }
                Some(ChannelCommand::Close) | None => {
                    let _ = channel.close().await;
                    break;
                }
            }
        }
    }

    tracing::trace!("Channel {:?} task finished", id);
}
