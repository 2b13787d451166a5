//! Local shells on pseudo-terminals

mod bridge;
mod shells;

pub use bridge::{spawn_local, LocalShell};
pub use shells::{available_shells, default_shell, validate_shell_path};
