//! Events pushed from the session core to its collaborators
//!
//! Events are grouped into one tagged enum per message family so that every
//! consumer can match exhaustively:
//!
//! - [`ShellEvent`]: bytes and close notifications for byte channels
//! - [`SftpEvent`]: transfer progress and completion
//! - [`AuthEvent`]: keyboard-interactive challenge exchange
//! - [`SelectionEvent`]: jump-server account selection exchange
//! - [`SessionEvent`]: lifecycle transitions and jump-chain progress
//!
//! On the wire each event is a single JSON object carrying a `family` tag and
//! a `type` tag, e.g. `{"family":"auth","type":"timeout","challengeId":...}`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{ChallengeId, ChannelId, SelectionId, SessionId, TaskKey};
use crate::sftp::TransferProgress;

/// Any event emitted by the session core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum CoreEvent {
    Shell(ShellEvent),
    Sftp(SftpEvent),
    Auth(AuthEvent),
    UserSelection(SelectionEvent),
    Session(SessionEvent),
}

/// Byte-channel events, delivered to channel consumers in arrival order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellEvent {
    /// Standard output bytes
    #[serde(rename_all = "camelCase")]
    Data { channel_id: ChannelId, data: Bytes },
    /// Standard error bytes
    #[serde(rename_all = "camelCase")]
    Stderr { channel_id: ChannelId, data: Bytes },
    /// The channel is closed; no further events follow
    #[serde(rename_all = "camelCase")]
    Close {
        channel_id: ChannelId,
        exit_code: Option<u32>,
    },
}

impl ShellEvent {
    /// Channel this event belongs to
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            ShellEvent::Data { channel_id, .. }
            | ShellEvent::Stderr { channel_id, .. }
            | ShellEvent::Close { channel_id, .. } => channel_id,
        }
    }
}

/// SFTP transfer events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SftpEvent {
    /// Throttled progress report
    Progress(TransferProgress),
    /// A transfer reached a terminal state
    #[serde(rename_all = "camelCase")]
    Finished {
        session_id: SessionId,
        task_key: TaskKey,
        outcome: TransferOutcome,
    },
}

/// Terminal state of a file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    Completed,
    Cancelled,
    Failed,
}

/// One keyboard-interactive prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    /// Prompt text shown to the user
    pub text: String,
    /// Whether the answer may be echoed on screen
    pub echo: bool,
}

impl Prompt {
    /// Create a new prompt
    pub fn new(text: impl Into<String>, echo: bool) -> Self {
        Self {
            text: text.into(),
            echo,
        }
    }
}

/// Final verdict of an authentication that involved a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Success,
    Failed,
}

/// Keyboard-interactive exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthEvent {
    /// The remote asked for answers; reply with a response or cancel
    #[serde(rename_all = "camelCase")]
    Request {
        challenge_id: ChallengeId,
        session_id: SessionId,
        /// Hop index when authenticating inside a jump chain
        hop: Option<usize>,
        host: String,
        name: String,
        instructions: String,
        prompts: Vec<Prompt>,
    },
    /// Nobody answered before the deadline
    #[serde(rename_all = "camelCase")]
    Timeout {
        challenge_id: ChallengeId,
        session_id: SessionId,
    },
    /// Authentication finished
    #[serde(rename_all = "camelCase")]
    Result {
        challenge_id: ChallengeId,
        session_id: SessionId,
        status: AuthStatus,
    },
}

/// One target account offered by a jump server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionCandidate {
    /// Opaque account id returned in the selection response
    pub id: String,
    /// Login name used for the next hop
    pub username: String,
    /// Human-readable label
    pub label: Option<String>,
}

/// Jump-server account selection exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SelectionEvent {
    /// The user must pick one account
    #[serde(rename_all = "camelCase")]
    Request {
        selection_id: SelectionId,
        session_id: SessionId,
        hop: usize,
        host: String,
        candidates: Vec<SelectionCandidate>,
    },
    /// Nobody answered before the deadline
    #[serde(rename_all = "camelCase")]
    Timeout {
        selection_id: SelectionId,
        session_id: SessionId,
    },
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transport being established
    Connecting,
    /// Waiting on authentication (possibly on a human)
    AuthPending,
    /// Authenticated and usable
    Ready,
    /// Transport alive but a channel failed unexpectedly
    Degraded,
    /// Closed on request
    Closed,
    /// Transport failed or connect attempt failed
    Failed,
}

impl SessionState {
    /// Whether the session can no longer carry traffic
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::AuthPending => "auth_pending",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Stage reached by one hop of a jump chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStage {
    Connecting,
    Authenticating,
    Established,
    Failed,
}

/// Lifecycle events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session changed state
    #[serde(rename_all = "camelCase")]
    State {
        session_id: SessionId,
        state: SessionState,
    },
    /// One hop of a jump chain progressed
    #[serde(rename_all = "camelCase")]
    ChainProgress {
        session_id: SessionId,
        hop: usize,
        host: String,
        stage: ChainStage,
    },
}
