//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use tl_protocol::Prompt;

pub use tl_protocol::{
    AuthMethod, ConnectionParams, HopSpec, LocalShellParams, SessionKind, SessionState,
};

/// Why an authentication attempt was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The remote refused the credentials or answers
    BadCredentials,
    /// Nobody answered a challenge in time
    Timeout,
    /// The user cancelled a challenge
    UserCancelled,
    /// Agent authentication was asked for but no agent is enabled or
    /// reachable
    AgentUnavailable,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::BadCredentials => write!(f, "bad credentials"),
            RejectReason::Timeout => write!(f, "timed out waiting for user input"),
            RejectReason::UserCancelled => write!(f, "cancelled by user"),
            RejectReason::AgentUnavailable => write!(f, "no SSH agent available"),
        }
    }
}

/// Authentication state of a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// Nothing attempted yet
    Unauthenticated,
    /// Suspended on a keyboard-interactive challenge
    AwaitingFactor(Vec<Prompt>),
    /// Channels may be opened
    Authenticated,
    /// Terminal failure
    Rejected(RejectReason),
    /// The connection failed before the server gave a verdict
    Interrupted,
}

impl AuthState {
    /// Whether channels may be opened
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated)
    }
}

/// How a channel behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// PTY-backed, resizable
    Shell,
    /// One-shot command with an exit code
    Exec,
    /// SFTP request/response
    Sftp,
}

/// What a channel is used for within its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPurpose {
    Shell,
    Sftp,
    Exec(u32),
}

impl ChannelPurpose {
    /// Channel mode implied by the purpose
    pub fn mode(&self) -> ChannelMode {
        match self {
            ChannelPurpose::Shell => ChannelMode::Shell,
            ChannelPurpose::Sftp => ChannelMode::Sftp,
            ChannelPurpose::Exec(_) => ChannelMode::Exec,
        }
    }
}

impl fmt::Display for ChannelPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelPurpose::Shell => write!(f, "shell"),
            ChannelPurpose::Sftp => write!(f, "sftp"),
            ChannelPurpose::Exec(n) => write!(f, "exec:{}", n),
        }
    }
}

impl FromStr for ChannelPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(ChannelPurpose::Shell),
            "sftp" => Ok(ChannelPurpose::Sftp),
            other => other
                .strip_prefix("exec:")
                .and_then(|n| n.parse().ok())
                .map(ChannelPurpose::Exec)
                .ok_or_else(|| format!("unknown channel purpose: {}", other)),
        }
    }
}
