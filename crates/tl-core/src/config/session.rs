//! Session core configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Tunables of the session core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// How long a keyboard-interactive challenge waits for the user
    #[serde(with = "duration_secs")]
    pub challenge_timeout: Duration,

    /// How long a jump-server account selection waits for the user
    #[serde(with = "duration_secs")]
    pub selection_timeout: Duration,

    /// TCP connect and handshake timeout, per hop
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Minimum spacing between two progress events of one transfer
    #[serde(with = "duration_millis")]
    pub progress_interval: Duration,

    /// Size of one transfer chunk in bytes
    pub transfer_chunk_size: usize,

    /// Outbound bytes buffered per channel before writers wait
    pub outbound_buffer_bytes: usize,

    /// How long a write waits for buffer space before failing
    #[serde(with = "duration_secs")]
    pub write_drain_timeout: Duration,

    /// Events queued per channel consumer
    pub consumer_queue_depth: usize,

    /// Maximum channels open on one transport
    pub max_channels_per_session: usize,

    /// How often transports are checked for liveness
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,

    /// TERM value requested for remote PTYs
    pub default_term: String,

    /// Attempts made by one explicit reconnect
    pub reconnect_attempts: u32,

    /// Backoff between explicit reconnect attempts
    pub backoff: BackoffConfig,

    /// SSH agent used for agent authentication and key management
    pub agent: AgentConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            challenge_timeout: Duration::from_secs(30),
            selection_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_millis(100),
            transfer_chunk_size: 64 * 1024,
            outbound_buffer_bytes: 256 * 1024,
            write_drain_timeout: Duration::from_secs(10),
            consumer_queue_depth: 256,
            max_channels_per_session: 10,
            health_check_interval: Duration::from_secs(5),
            default_term: "xterm-256color".to_string(),
            reconnect_attempts: 5,
            backoff: BackoffConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// SSH agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Use the agent from startup; otherwise it stays off until configured
    pub enabled: bool,

    /// Agent socket. `SSH_AUTH_SOCK` is used when unset.
    pub socket: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.challenge_timeout, Duration::from_secs(30));
        assert_eq!(config.progress_interval, Duration::from_millis(100));
        assert_eq!(config.transfer_chunk_size, 65536);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: CoreConfig = toml::from_str(
            r#"
            challenge_timeout = 5
            progress_interval = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.challenge_timeout, Duration::from_secs(5));
        assert_eq!(config.progress_interval, Duration::from_millis(250));
        assert_eq!(config.selection_timeout, Duration::from_secs(30));
        assert_eq!(config.default_term, "xterm-256color");
        assert!(!config.agent.enabled);
    }

    #[test]
    fn test_agent_section() {
        let config: CoreConfig = toml::from_str(
            r#"
            [agent]
            enabled = true
            socket = "/run/user/1000/agent.sock"
            "#,
        )
        .unwrap();
        assert!(config.agent.enabled);
        assert_eq!(
            config.agent.socket,
            Some(PathBuf::from("/run/user/1000/agent.sock"))
        );
    }
}
