//! Connection parameters supplied by the caller
//!
//! Credentials arrive already decrypted. They are held in [`Secret`], which
//! wipes its buffer on drop and never prints its contents.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use zeroize::Zeroize;

use crate::event::SelectionCandidate;
use crate::terminal::TerminalSize;

/// A credential string, wiped from memory on drop
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a credential
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the credential
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

fn default_port() -> u16 {
    22
}

/// How to authenticate one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Plain password
    Password { password: Secret },
    /// OpenSSH or PEM private key, optionally encrypted
    PublicKey {
        private_key: Secret,
        #[serde(default)]
        passphrase: Option<Secret>,
    },
    /// Server-driven prompts. A password, when given, answers rounds that
    /// only ask for a password.
    KeyboardInteractive {
        #[serde(default)]
        password: Option<Secret>,
    },
    /// Keys held by the SSH agent, tried in the order it lists them
    Agent,
}

impl AuthMethod {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
            AuthMethod::Agent => "agent",
        }
    }
}

/// One bastion hop of a jump chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopSpec {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    /// Accounts reachable through this hop. With more than one, the user is
    /// asked to pick; the chosen login name is used on the next hop.
    #[serde(default)]
    pub target_accounts: Vec<SelectionCandidate>,
    /// Expected host key fingerprint (`SHA256:...`)
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
}

/// Everything needed to open a remote session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    /// Bastion hops traversed in order before the target
    #[serde(default)]
    pub jump_chain: Vec<HopSpec>,
    /// Expected host key fingerprint of the target (`SHA256:...`)
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
}

impl ConnectionParams {
    /// Password-authenticated direct connection
    pub fn password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth: AuthMethod::Password {
                password: Secret::new(password),
            },
            jump_chain: Vec::new(),
            host_key_fingerprint: None,
        }
    }

    /// The target expressed as the last hop of the chain
    pub fn target_hop(&self) -> HopSpec {
        HopSpec {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth: self.auth.clone(),
            target_accounts: Vec::new(),
            host_key_fingerprint: self.host_key_fingerprint.clone(),
        }
    }

    /// `user@host:port` for logs and listings
    pub fn display_target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Parameters for a local shell session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalShellParams {
    /// Shell executable (platform default when absent)
    pub shell: Option<String>,
    /// Working directory (home directory when absent)
    pub cwd: Option<String>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Initial terminal size
    pub size: TerminalSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_params_defaults() {
        let json = r#"{
            "host": "example.com",
            "username": "alice",
            "auth": {"method": "keyboard_interactive"}
        }"#;
        let params: ConnectionParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.port, 22);
        assert!(params.jump_chain.is_empty());
        assert_eq!(
            params.auth,
            AuthMethod::KeyboardInteractive { password: None }
        );
    }

    #[test]
    fn test_agent_method_parse() {
        let json = r#"{"host": "h", "username": "u", "auth": {"method": "agent"}}"#;
        let params: ConnectionParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.auth, AuthMethod::Agent);
        assert_eq!(params.auth.name(), "agent");
    }

    #[test]
    fn test_jump_chain_parse() {
        let json = r#"{
            "host": "db.internal",
            "username": "app",
            "auth": {"method": "password", "password": "x"},
            "jump_chain": [{
                "host": "bastion",
                "port": 2222,
                "username": "ops",
                "auth": {"method": "public_key", "private_key": "KEY"},
                "target_accounts": [
                    {"id": "1", "username": "app", "label": null},
                    {"id": "2", "username": "root", "label": "admin"}
                ]
            }]
        }"#;
        let params: ConnectionParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.jump_chain.len(), 1);
        assert_eq!(params.jump_chain[0].port, 2222);
        assert_eq!(params.jump_chain[0].target_accounts.len(), 2);
        assert_eq!(params.target_hop().host, "db.internal");
    }
}
