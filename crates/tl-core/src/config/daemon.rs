//! Daemon configuration

use serde::{Deserialize, Serialize};

use super::CoreConfig;

/// Configuration for the IPC daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the IPC listener binds to (must be loopback)
    pub bind_address: String,

    /// Log level used when `RUST_LOG` is unset
    pub log_level: String,

    /// Session core tunables
    pub session: CoreConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:22240".to_string(),
            log_level: "info".to_string(),
            session: CoreConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Whether the bind address is a loopback address
    pub fn is_loopback(&self) -> bool {
        self.bind_address
            .parse::<std::net::SocketAddr>()
            .map(|addr| addr.ip().is_loopback())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_loopback() {
        assert!(DaemonConfig::default().is_loopback());
    }

    #[test]
    fn test_public_bind_is_not_loopback() {
        let config = DaemonConfig {
            bind_address: "0.0.0.0:22240".to_string(),
            ..Default::default()
        };
        assert!(!config.is_loopback());
    }
}
