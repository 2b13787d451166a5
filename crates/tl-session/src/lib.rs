//! tl-session: The Termlink session core
//!
//! This crate establishes SSH transports (directly or through a chain of jump
//! servers), coordinates interactive authentication, multiplexes shell and
//! exec channels, runs SFTP transfers, manages SSH agent keys and bridges
//! local PTY shells. The [`SessionHub`] is the entry point; everything else
//! is reachable from it.

pub mod agent;
pub mod auth;
pub mod backoff;
pub mod channel;
pub mod events;
pub mod hub;
pub mod jump;
pub mod mux;
pub mod pty;
pub mod registry;
pub mod session;
pub mod sftp;
pub mod transport;

pub use agent::{AgentManager, RusshAgent};
pub use auth::{AuthCoordinator, AuthObserver};
pub use channel::{ChannelHandle, ChannelOptions};
pub use events::EventBus;
pub use hub::{ExecOutput, SessionHub};
pub use mux::ChannelMux;
pub use registry::SessionRegistry;
pub use session::{Session, SessionParams};
pub use sftp::{RusshFsFactory, SftpChannel, TaskRegistry};
pub use transport::ssh::RusshConnector;
pub use transport::Transport;
