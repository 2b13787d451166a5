//! tl-protocol: Boundary vocabulary for the Termlink session core
//!
//! This crate defines the identifiers, pushed events and IPC envelopes that
//! the session core exchanges with its external collaborators (the terminal
//! UI, the AI agent, and the IPC daemon). Every payload family is a tagged
//! enum so consumers can match exhaustively.

pub mod error;
pub mod event;
pub mod ids;
pub mod ipc;
pub mod params;
pub mod sftp;
pub mod terminal;

pub use error::ProtocolError;
pub use event::{
    AuthEvent, AuthStatus, ChainStage, CoreEvent, Prompt, SelectionCandidate, SelectionEvent,
    SessionEvent, SessionState, SftpEvent, ShellEvent, TransferOutcome,
};
pub use ids::{ChallengeId, ChannelId, SelectionId, SessionId, TaskKey};
pub use ipc::{
    AgentKeyInfo, ChannelSummary, Request, RequestEnvelope, Response, ResponseEnvelope, ServerMessage,
    SessionInfo, SessionKind,
};
pub use params::{AuthMethod, ConnectionParams, HopSpec, LocalShellParams, Secret};
pub use sftp::{FileRecord, TransferKind, TransferProgress};
pub use terminal::TerminalSize;
