//! Core error types for Termlink

use std::path::PathBuf;
use thiserror::Error;
use tl_protocol::ProtocolError;

use crate::types::RejectReason;

/// Top-level error type for the session core
#[derive(Error, Debug)]
pub enum CoreError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// SFTP error
    #[error("SFTP error: {0}")]
    Sftp(#[from] SftpError),

    /// Challenge error
    #[error("Challenge error: {0}")]
    Challenge(#[from] ChallengeError),

    /// SSH agent error
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Stable name of the error for boundary payloads
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Protocol(_) => "InvalidRequest",
            CoreError::Transport(e) => e.code(),
            CoreError::Channel(e) => e.code(),
            CoreError::Session(e) => e.code(),
            CoreError::Sftp(e) => e.code(),
            CoreError::Challenge(e) => e.code(),
            CoreError::Agent(e) => e.code(),
            CoreError::Config(_) => "ConfigInvalid",
            CoreError::Io(_) => "Io",
        }
    }
}

/// Transport and authentication errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// TCP connect failed or timed out
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// SSH handshake failed
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Server host key did not match the expected fingerprint
    #[error("Host key rejected for {host}: {fingerprint}")]
    HostKeyRejected { host: String, fingerprint: String },

    /// Operation requires an authenticated transport
    #[error("Transport is not authenticated")]
    NotAuthenticated,

    /// Authentication was rejected
    #[error("Authentication rejected: {0}")]
    AuthRejected(RejectReason),

    /// Too many channels open on this transport
    #[error("Channel limit exceeded")]
    ChannelLimitExceeded,

    /// Remote refused a channel or request
    #[error("Remote rejected request: {0}")]
    RemoteRejected(String),

    /// A jump-chain hop could not be reached
    #[error("Hop {index} ({host}) unreachable: {reason}")]
    HopUnreachable {
        index: usize,
        host: String,
        reason: String,
    },

    /// A jump-chain hop rejected authentication
    #[error("Hop {index} ({host}) authentication failed: {reason}")]
    HopAuthFailed {
        index: usize,
        host: String,
        reason: RejectReason,
    },

    /// Transport is closed
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Stable name of the error for boundary payloads
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::NetworkUnreachable(_) => "NetworkUnreachable",
            TransportError::HandshakeFailed(_) => "HandshakeFailed",
            TransportError::HostKeyRejected { .. } => "HostKeyRejected",
            TransportError::NotAuthenticated => "NotAuthenticated",
            TransportError::AuthRejected(_) => "AuthRejected",
            TransportError::ChannelLimitExceeded => "ChannelLimitExceeded",
            TransportError::RemoteRejected(_) => "RemoteRejected",
            TransportError::HopUnreachable { .. } => "HopUnreachable",
            TransportError::HopAuthFailed { .. } => "HopAuthFailed",
            TransportError::Closed => "ChannelClosed",
        }
    }

    /// Whether retrying the same parameters cannot help
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransportError::AuthRejected(_)
                | TransportError::HostKeyRejected { .. }
                | TransportError::HopAuthFailed { .. }
        )
    }
}

/// Channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No channel with this id or purpose
    #[error("Channel not found: {0}")]
    NotFound(String),

    /// Channel (or its transport) is closed
    #[error("Channel closed: {0}")]
    Closed(String),

    /// Outbound buffer stayed full past the drain timeout
    #[error("Channel outbound buffer full")]
    WouldBlock,

    /// Resize on a channel without a PTY
    #[error("Channel {0} has no PTY")]
    NotAPty(String),
}

impl ChannelError {
    /// Stable name of the error for boundary payloads
    pub fn code(&self) -> &'static str {
        match self {
            ChannelError::NotFound(_) => "ChannelNotFound",
            ChannelError::Closed(_) => "ChannelClosed",
            ChannelError::WouldBlock => "WouldBlock",
            ChannelError::NotAPty(_) => "NotAPty",
        }
    }
}

/// Session-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Session not found
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Session exists with different connection parameters
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// A connect for this session is already in progress
    #[error("Session is connecting: {0}")]
    Connecting(String),

    /// Operation does not apply to this kind of session
    #[error("Operation not supported by session {0}")]
    WrongKind(String),

    /// PTY allocation failed
    #[error("PTY allocation failed: {0}")]
    PtyAllocation(String),

    /// Requested shell is not allowed
    #[error("Invalid shell: {0}")]
    InvalidShell(String),
}

impl SessionError {
    /// Stable name of the error for boundary payloads
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => "SessionNotFound",
            SessionError::AlreadyExists(_) => "SessionExists",
            SessionError::Connecting(_) => "SessionConnecting",
            SessionError::WrongKind(_) => "WrongSessionKind",
            SessionError::PtyAllocation(_) => "PtyAllocation",
            SessionError::InvalidShell(_) => "InvalidShell",
        }
    }
}

/// SFTP errors. Remote messages are carried verbatim.
#[derive(Error, Debug)]
pub enum SftpError {
    /// Remote path does not exist
    #[error("No such file: {0}")]
    PathNotFound(String),

    /// Remote refused access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Any other remote failure
    #[error("{0}")]
    Remote(String),

    /// Transfer was cancelled
    #[error("Transfer cancelled")]
    TransferCancelled,

    /// A transfer with this key is already running
    #[error("Transfer already running: {0}")]
    TaskExists(String),

    /// Local file I/O failed
    #[error("Local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SftpError {
    /// Stable name of the error for boundary payloads
    pub fn code(&self) -> &'static str {
        match self {
            SftpError::PathNotFound(_) => "PathNotFound",
            SftpError::PermissionDenied(_) => "PermissionDenied",
            SftpError::Remote(_) => "RemoteError",
            SftpError::TransferCancelled => "TransferCancelled",
            SftpError::TaskExists(_) => "TaskExists",
            SftpError::Io(_) => "Io",
        }
    }
}

/// Errors resolving a pending challenge or selection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChallengeError {
    /// A challenge is already outstanding for this transport
    #[error("Challenge already outstanding for {0}")]
    Outstanding(String),

    /// No pending challenge with this id (never existed or already resolved)
    #[error("Unknown challenge: {0}")]
    Unknown(String),
}

impl ChallengeError {
    /// Stable name of the error for boundary payloads
    pub fn code(&self) -> &'static str {
        match self {
            ChallengeError::Outstanding(_) => "ChallengeOutstanding",
            ChallengeError::Unknown(_) => "ChallengeUnknown",
        }
    }
}

/// SSH agent errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// Agent use is switched off
    #[error("SSH agent is disabled")]
    Disabled,

    /// No agent could be reached
    #[error("SSH agent unavailable: {0}")]
    Unavailable(String),

    /// The key could not be decoded or was refused by the agent
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The agent holds no key with this id
    #[error("Key not found: {0}")]
    KeyNotFound(String),
}

impl AgentError {
    /// Stable name of the error for boundary payloads
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Disabled => "AgentDisabled",
            AgentError::Unavailable(_) => "AgentUnavailable",
            AgentError::InvalidKey(_) => "InvalidKey",
            AgentError::KeyNotFound(_) => "KeyNotFound",
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
