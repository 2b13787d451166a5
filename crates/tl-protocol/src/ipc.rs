//! IPC envelopes between a front-end and the session daemon
//!
//! Newline-delimited JSON over TCP on localhost. Every request carries a
//! client-chosen `id` echoed on its response, so long-running requests
//! (transfers, connects waiting on a human) do not hold up the rest of the
//! connection. Events are pushed between responses and are told apart by
//! their `family` tag.

use serde::{Deserialize, Serialize};

use crate::event::{CoreEvent, SessionState, TransferOutcome};
use crate::ids::{ChallengeId, ChannelId, SelectionId, SessionId, TaskKey};
use crate::params::{ConnectionParams, LocalShellParams, Secret};
use crate::sftp::FileRecord;
use crate::terminal::TerminalSize;

/// Request from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Keepalive
    Ping,

    /// Open a remote session
    Connect {
        session_id: SessionId,
        params: ConnectionParams,
    },

    /// Re-run connect with the stored parameters
    Reconnect { session_id: SessionId },

    /// Close a session (idempotent)
    Disconnect { session_id: SessionId },

    /// List known sessions
    ListSessions,

    /// Open (or reuse) the interactive shell of a session
    Shell {
        session_id: SessionId,
        size: Option<TerminalSize>,
    },

    /// Send bytes to a channel
    Write { channel_id: ChannelId, data: Vec<u8> },

    /// Resize a PTY channel
    Resize {
        channel_id: ChannelId,
        cols: u16,
        rows: u16,
    },

    /// Close one channel, leaving its siblings open
    CloseChannel { channel_id: ChannelId },

    /// Run a command to completion
    Exec {
        session_id: SessionId,
        command: String,
    },

    /// Answer a keyboard-interactive challenge
    ChallengeResponse {
        challenge_id: ChallengeId,
        answers: Vec<String>,
    },

    /// Give up on a keyboard-interactive challenge
    ChallengeCancel { challenge_id: ChallengeId },

    /// Pick a jump-server target account
    SelectionResponse {
        selection_id: SelectionId,
        account_id: String,
    },

    /// Give up on a jump-server account selection
    SelectionCancel { selection_id: SelectionId },

    /// List a remote directory
    SftpList { session_id: SessionId, path: String },

    /// Upload one local file
    SftpUploadFile {
        session_id: SessionId,
        local_path: String,
        remote_path: String,
        task_key: Option<TaskKey>,
    },

    /// Upload a local directory tree
    SftpUploadDirectory {
        session_id: SessionId,
        local_path: String,
        remote_path: String,
        task_key: Option<TaskKey>,
    },

    /// Download one remote file
    SftpDownloadFile {
        session_id: SessionId,
        remote_path: String,
        local_path: String,
        task_key: Option<TaskKey>,
    },

    /// Rename or move a remote path
    SftpRename {
        session_id: SessionId,
        from: String,
        to: String,
    },

    /// Delete a remote file or directory tree
    SftpDelete { session_id: SessionId, path: String },

    /// Change remote permission bits
    SftpChmod {
        session_id: SessionId,
        path: String,
        mode: u32,
        #[serde(default)]
        recursive: bool,
    },

    /// Stop a running transfer before its next chunk
    CancelTask { task_key: TaskKey },

    /// Whether a session can serve SFTP
    SftpAvailable { session_id: SessionId },

    /// Sessions with an open SFTP channel
    SftpSessions,

    /// Start a local shell
    ConnectLocal {
        session_id: Option<SessionId>,
        #[serde(default)]
        params: LocalShellParams,
    },

    /// Usable local shells
    AvailableShells,

    /// Receive shell events for a channel on this connection
    Subscribe { channel_id: ChannelId },

    /// Stop receiving shell events for a channel
    Unsubscribe { channel_id: ChannelId },

    /// Turn use of the SSH agent on or off
    AgentConfigure { enabled: bool },

    /// Load a private key into the SSH agent
    AgentAddKey {
        private_key: Secret,
        #[serde(default)]
        passphrase: Option<Secret>,
        #[serde(default)]
        comment: Option<String>,
    },

    /// Remove a key from the SSH agent
    AgentRemoveKey { key_id: String },

    /// Keys held by the SSH agent
    AgentListKeys,

    /// Stop the daemon
    Shutdown,
}

/// Response from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Generic success
    Ok,

    /// Pong response
    Pong,

    /// Session is ready
    Connected { session_id: SessionId },

    /// Local shell started
    LocalConnected {
        session_id: SessionId,
        channel_id: ChannelId,
    },

    /// Known sessions
    Sessions { sessions: Vec<SessionInfo> },

    /// Channel opened or reused
    Channel { channel_id: ChannelId },

    /// Result of a one-shot command
    ExecOutput {
        stdout: String,
        stderr: String,
        exit_code: Option<u32>,
    },

    /// Directory listing
    Entries { entries: Vec<FileRecord> },

    /// A transfer finished
    Transfer {
        task_key: TaskKey,
        outcome: TransferOutcome,
    },

    /// Boolean query answer
    Available { available: bool },

    /// Session ids
    SessionIds { session_ids: Vec<SessionId> },

    /// Shell executables
    Shells { shells: Vec<String> },

    /// A key just loaded into the agent
    AgentKey { key: AgentKeyInfo },

    /// Keys held by the agent
    AgentKeys { keys: Vec<AgentKeyInfo> },

    /// Error response; `code` is a stable taxonomy name
    Error { code: String, message: String },
}

/// Kind of session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Remote,
    Local,
}

/// Public description of one agent key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentKeyInfo {
    /// `SHA256:` fingerprint of the public key
    pub key_id: String,
    /// Key algorithm, e.g. `ssh-ed25519`
    pub algorithm: String,
    pub comment: String,
}

/// One open channel of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub channel_id: ChannelId,
    /// `shell`, `sftp` or `exec:<n>`
    pub purpose: String,
}

/// Session information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub kind: SessionKind,
    pub state: SessionState,
    /// `user@host:port` for remote sessions, shell path for local ones
    pub target: String,
    pub channels: Vec<ChannelSummary>,
}

/// Request with its correlation id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

/// Response with the id of the request it answers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub response: Response,
}

/// Anything the daemon writes to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(ResponseEnvelope),
    Event(CoreEvent),
}

impl ServerMessage {
    /// Serialize to one JSON line (without the newline)
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse one JSON line
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

impl From<ResponseEnvelope> for ServerMessage {
    fn from(resp: ResponseEnvelope) -> Self {
        ServerMessage::Response(resp)
    }
}

impl From<CoreEvent> for ServerMessage {
    fn from(event: CoreEvent) -> Self {
        ServerMessage::Event(event)
    }
}
