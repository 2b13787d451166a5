//! tl-core: Core abstractions and configuration for Termlink
//!
//! This crate provides the error taxonomy, configuration structures, domain
//! types and backend traits shared by the session core and the daemon.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::CoreError;
pub use types::{AuthState, ChannelMode, ChannelPurpose, RejectReason};
