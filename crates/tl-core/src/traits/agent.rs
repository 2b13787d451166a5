//! SSH agent trait

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::AgentError;
use tl_protocol::AgentKeyInfo;

/// Key store of an SSH agent
#[async_trait]
pub trait KeyAgent: Send + Sync {
    /// Socket a link connects to for agent authentication
    fn socket(&self) -> Result<PathBuf, AgentError>;

    /// Keys the agent currently holds
    async fn list_keys(&self) -> Result<Vec<AgentKeyInfo>, AgentError>;

    /// Decode a private key and hand it to the agent
    async fn add_key(
        &self,
        private_key: &str,
        passphrase: Option<&str>,
        comment: Option<&str>,
    ) -> Result<AgentKeyInfo, AgentError>;

    /// Remove the key with this fingerprint
    async fn remove_key(&self, key_id: &str) -> Result<(), AgentError>;
}
