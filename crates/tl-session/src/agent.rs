//! SSH agent
//!
//! [`RusshAgent`] manages the keys of an ssh-agent reached over its Unix
//! socket. [`AgentManager`] sits in front of it: agent authentication and key
//! management only work while the agent is switched on.

use async_trait::async_trait;
use russh_keys::agent::client::AgentClient;
use russh_keys::key::PublicKey;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tl_core::config::AgentConfig;
use tl_core::error::AgentError;
use tl_core::traits::KeyAgent;
use tl_protocol::AgentKeyInfo;

#[cfg(unix)]
type AgentStream = tokio::net::UnixStream;

#[cfg(not(unix))]
type AgentStream = tokio::io::DuplexStream;

/// `SHA256:` fingerprint used as the key id
pub fn key_id(key: &PublicKey) -> String {
    format!("SHA256:{}", key.fingerprint())
}

/// ssh-agent reached over a Unix socket
pub struct RusshAgent {
    socket: Option<PathBuf>,
    /// The agent protocol drops comments on listing; remember ours
    comments: Mutex<HashMap<String, String>>,
}

impl RusshAgent {
    /// Agent at `socket`, or at `SSH_AUTH_SOCK` when `None`
    pub fn new(socket: Option<PathBuf>) -> Self {
        Self {
            socket,
            comments: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(unix)]
    async fn client(&self) -> Result<AgentClient<AgentStream>, AgentError> {
        let socket = self.socket()?;
        AgentClient::connect_uds(&socket)
            .await
            .map_err(|e| AgentError::Unavailable(format!("{}: {}", socket.display(), e)))
    }

    #[cfg(not(unix))]
    async fn client(&self) -> Result<AgentClient<AgentStream>, AgentError> {
        Err(AgentError::Unavailable(
            "agent sockets are only supported on Unix".to_string(),
        ))
    }

    fn describe(&self, key: &PublicKey) -> AgentKeyInfo {
        let key_id = key_id(key);
        let comment = self
            .comments
            .lock()
            .ok()
            .and_then(|c| c.get(&key_id).cloned())
            .unwrap_or_default();
        AgentKeyInfo {
            key_id,
            algorithm: key.name().to_string(),
            comment,
        }
    }
}

#[async_trait]
impl KeyAgent for RusshAgent {
    fn socket(&self) -> Result<PathBuf, AgentError> {
        self.socket
            .clone()
            .or_else(|| std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from))
            .ok_or_else(|| AgentError::Unavailable("SSH_AUTH_SOCK is not set".to_string()))
    }

    async fn list_keys(&self) -> Result<Vec<AgentKeyInfo>, AgentError> {
        let mut client = self.client().await?;
        let keys = client
            .request_identities()
            .await
            .map_err(|e| AgentError::Unavailable(e.to_string()))?;
        Ok(keys.iter().map(|key| self.describe(key)).collect())
    }

    async fn add_key(
        &self,
        private_key: &str,
        passphrase: Option<&str>,
        comment: Option<&str>,
    ) -> Result<AgentKeyInfo, AgentError> {
        let pair = russh_keys::decode_secret_key(private_key, passphrase)
            .map_err(|e| AgentError::InvalidKey(e.to_string()))?;
        let public = pair
            .clone_public_key()
            .map_err(|e| AgentError::InvalidKey(e.to_string()))?;

        let mut client = self.client().await?;
        client
            .add_identity(&pair, &[])
            .await
            .map_err(|e| AgentError::InvalidKey(e.to_string()))?;

        if let (Some(comment), Ok(mut comments)) = (comment, self.comments.lock()) {
            comments.insert(key_id(&public), comment.to_string());
        }
        let info = self.describe(&public);
        tracing::info!("Added {} key {} to the SSH agent", info.algorithm, info.key_id);
        Ok(info)
    }

    async fn remove_key(&self, key_id_to_remove: &str) -> Result<(), AgentError> {
        let mut client = self.client().await?;
        let keys = client
            .request_identities()
            .await
            .map_err(|e| AgentError::Unavailable(e.to_string()))?;
        let key = keys
            .iter()
            .find(|key| key_id(key) == key_id_to_remove)
            .ok_or_else(|| AgentError::KeyNotFound(key_id_to_remove.to_string()))?;

        client
            .remove_identity(key)
            .await
            .map_err(|e| AgentError::Unavailable(e.to_string()))?;
        if let Ok(mut comments) = self.comments.lock() {
            comments.remove(key_id_to_remove);
        }
        tracing::info!("Removed key {} from the SSH agent", key_id_to_remove);
        Ok(())
    }
}

/// On/off switch in front of a [`KeyAgent`]
pub struct AgentManager {
    agent: Arc<dyn KeyAgent>,
    enabled: AtomicBool,
}

impl AgentManager {
    /// Wrap an agent
    pub fn new(agent: Arc<dyn KeyAgent>, enabled: bool) -> Self {
        Self {
            agent,
            enabled: AtomicBool::new(enabled),
        }
    }

    /// The russh agent described by `config`
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(Arc::new(RusshAgent::new(config.socket.clone())), config.enabled)
    }

    /// Whether agent use is switched on
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Switch agent use on or off. Switching on fails, and leaves the agent
    /// off, when it cannot be reached.
    pub async fn configure(&self, enabled: bool) -> Result<(), AgentError> {
        if enabled {
            self.agent.list_keys().await?;
        }
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!("SSH agent {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub async fn list_keys(&self) -> Result<Vec<AgentKeyInfo>, AgentError> {
        self.check()?;
        self.agent.list_keys().await
    }

    pub async fn add_key(
        &self,
        private_key: &str,
        passphrase: Option<&str>,
        comment: Option<&str>,
    ) -> Result<AgentKeyInfo, AgentError> {
        self.check()?;
        self.agent.add_key(private_key, passphrase, comment).await
    }

    pub async fn remove_key(&self, key_id: &str) -> Result<(), AgentError> {
        self.check()?;
        self.agent.remove_key(key_id).await
    }

    /// Socket to authenticate through, once the agent is on and holds at
    /// least one key
    pub async fn auth_socket(&self) -> Result<PathBuf, AgentError> {
        self.check()?;
        if self.agent.list_keys().await?.is_empty() {
            return Err(AgentError::Unavailable("agent holds no keys".to_string()));
        }
        self.agent.socket()
    }

    fn check(&self) -> Result<(), AgentError> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(AgentError::Disabled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Agent that keeps "keys" as plain strings
    #[derive(Default)]
    struct MemoryAgent {
        keys: Mutex<Vec<AgentKeyInfo>>,
    }

    #[async_trait]
    impl KeyAgent for MemoryAgent {
        fn socket(&self) -> Result<PathBuf, AgentError> {
            Ok(PathBuf::from("/tmp/memory-agent.sock"))
        }

        async fn list_keys(&self) -> Result<Vec<AgentKeyInfo>, AgentError> {
            Ok(self.keys.lock().unwrap().clone())
        }

        async fn add_key(
            &self,
            private_key: &str,
            _passphrase: Option<&str>,
            comment: Option<&str>,
        ) -> Result<AgentKeyInfo, AgentError> {
            let info = AgentKeyInfo {
                key_id: format!("SHA256:{}", private_key),
                algorithm: "ssh-ed25519".to_string(),
                comment: comment.unwrap_or_default().to_string(),
            };
            self.keys.lock().unwrap().push(info.clone());
            Ok(info)
        }

        async fn remove_key(&self, key_id: &str) -> Result<(), AgentError> {
            let mut keys = self.keys.lock().unwrap();
            let before = keys.len();
            keys.retain(|k| k.key_id != key_id);
            if keys.len() == before {
                return Err(AgentError::KeyNotFound(key_id.to_string()));
            }
            Ok(())
        }
    }

    fn manager(enabled: bool) -> AgentManager {
        AgentManager::new(Arc::new(MemoryAgent::default()), enabled)
    }

    #[tokio::test]
    async fn test_disabled_agent_refuses_everything() {
        let agent = manager(false);
        assert_eq!(agent.list_keys().await.unwrap_err(), AgentError::Disabled);
        assert_eq!(
            agent.add_key("k", None, None).await.unwrap_err(),
            AgentError::Disabled
        );
        assert_eq!(agent.auth_socket().await.unwrap_err(), AgentError::Disabled);
    }

    #[tokio::test]
    async fn test_key_lifecycle() {
        let agent = manager(false);
        agent.configure(true).await.unwrap();

        let added = agent.add_key("abc", None, Some("laptop")).await.unwrap();
        assert_eq!(added.comment, "laptop");
        assert_eq!(agent.list_keys().await.unwrap(), vec![added.clone()]);

        agent.remove_key(&added.key_id).await.unwrap();
        assert!(agent.list_keys().await.unwrap().is_empty());
        assert_eq!(
            agent.remove_key(&added.key_id).await.unwrap_err().code(),
            "KeyNotFound"
        );
    }

    #[tokio::test]
    async fn test_auth_socket_needs_a_key() {
        let agent = manager(true);
        assert!(matches!(
            agent.auth_socket().await,
            Err(AgentError::Unavailable(_))
        ));

        agent.add_key("abc", None, None).await.unwrap();
        assert_eq!(
            agent.auth_socket().await.unwrap(),
            PathBuf::from("/tmp/memory-agent.sock")
        );
    }

    #[tokio::test]
    async fn test_unreachable_socket_keeps_agent_off() {
        let dir = tempfile::tempdir().unwrap();
        let agent = AgentManager::new(
            Arc::new(RusshAgent::new(Some(dir.path().join("missing.sock")))),
            false,
        );

        let err = agent.configure(true).await.unwrap_err();
        assert_eq!(err.code(), "AgentUnavailable");
        assert!(!agent.is_enabled());
    }

    #[tokio::test]
    async fn test_undecodable_key_is_invalid() {
        let agent = RusshAgent::new(Some(PathBuf::from("/nonexistent/agent.sock")));
        let err = agent
            .add_key("not a private key", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidKey");
    }
}
