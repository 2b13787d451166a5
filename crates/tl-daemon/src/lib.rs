//! tl-daemon: IPC front door for the Termlink session core
//!
//! The daemon owns one [`tl_session::SessionHub`] and serves it to local
//! front-ends (the terminal UI, the agent) as newline-delimited JSON over a
//! loopback TCP socket.

pub mod handler;
pub mod server;

pub use server::IpcServer;
