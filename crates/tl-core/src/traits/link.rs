//! SSH link traits

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::{ChannelError, TransportError};
use tl_protocol::{Prompt, TerminalSize};

/// A bidirectional byte stream a transport can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Owned, type-erased byte stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Where to connect one hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub host: String,
    pub port: u16,
    /// Expected host key fingerprint; any key is accepted when absent
    pub host_key_fingerprint: Option<String>,
}

impl HostTarget {
    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One server reply during keyboard-interactive authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyboardInteractiveReply {
    /// Authenticated
    Success,
    /// Rejected
    Failure,
    /// Another round of prompts
    Prompts {
        name: String,
        instructions: String,
        prompts: Vec<Prompt>,
    },
}

/// What kind of byte channel to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    /// Interactive shell with a PTY
    Shell { term: String, size: TerminalSize },
    /// One-shot command
    Exec { command: String },
}

/// What kind of raw stream to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRequest {
    /// A subsystem such as `sftp`
    Subsystem(String),
    /// A forwarded TCP connection (used to tunnel the next hop)
    DirectTcpip { host: String, port: u16 },
}

/// Inbound item of a byte channel. The channel is closed when the receiver
/// yields `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelInput {
    Data(Bytes),
    Stderr(Bytes),
    ExitStatus(u32),
    Eof,
}

/// Outbound half of a byte channel
#[async_trait]
pub trait ChannelControl: Send + Sync {
    /// Send bytes to the remote side
    async fn write(&self, data: Bytes) -> Result<(), ChannelError>;

    /// Change the PTY window size
    async fn resize(&self, size: TerminalSize) -> Result<(), ChannelError>;

    /// Signal end of input
    async fn eof(&self) -> Result<(), ChannelError>;

    /// Close the channel
    async fn close(&self) -> Result<(), ChannelError>;
}

/// An opened byte channel
pub struct LinkChannel {
    /// Inbound items in arrival order
    pub inbound: mpsc::Receiver<ChannelInput>,
    /// Outbound control
    pub control: Arc<dyn ChannelControl>,
}

/// One SSH connection to one host
#[async_trait]
pub trait SshLink: Send + Sync {
    /// Authenticate with a password
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<bool, TransportError>;

    /// Authenticate with a private key
    async fn auth_publickey(
        &mut self,
        user: &str,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> Result<bool, TransportError>;

    /// Authenticate with the keys of the agent listening on `socket`
    async fn auth_agent(&mut self, user: &str, socket: &Path) -> Result<bool, TransportError>;

    /// Begin keyboard-interactive authentication
    async fn auth_keyboard_interactive_start(
        &mut self,
        user: &str,
    ) -> Result<KeyboardInteractiveReply, TransportError>;

    /// Answer the last round of prompts
    async fn auth_keyboard_interactive_respond(
        &mut self,
        answers: Vec<String>,
    ) -> Result<KeyboardInteractiveReply, TransportError>;

    /// Open a byte channel
    async fn open_channel(&self, request: ChannelRequest) -> Result<LinkChannel, TransportError>;

    /// Open a raw stream
    async fn open_stream(&self, request: StreamRequest) -> Result<BoxedStream, TransportError>;

    /// Close the connection. Idempotent.
    async fn disconnect(&self);

    /// Whether the underlying connection is gone
    fn is_closed(&self) -> bool;
}

/// Creates SSH links
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to a host over TCP and complete the handshake
    async fn connect(&self, target: &HostTarget) -> Result<Box<dyn SshLink>, TransportError>;

    /// Complete a handshake over an existing stream
    async fn connect_over(
        &self,
        stream: BoxedStream,
        target: &HostTarget,
    ) -> Result<Box<dyn SshLink>, TransportError>;
}
