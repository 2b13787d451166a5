//! Channel multiplexer
//!
//! Resolves channel ids (or a session and purpose) to open channels and
//! forwards writes, resizes and closes to them.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use tl_core::error::ChannelError;
use tl_core::types::ChannelPurpose;
use tl_protocol::{ChannelId, SessionId, ShellEvent, TerminalSize};

use crate::channel::ChannelHandle;
use crate::registry::SessionRegistry;

/// Routes channel operations through the session registry
#[derive(Clone)]
pub struct ChannelMux {
    registry: Arc<SessionRegistry>,
}

impl ChannelMux {
    /// Create a multiplexer over a registry
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Look up an open channel.
    ///
    /// Ids of channels (or sessions) that existed and are gone fail with
    /// `ChannelClosed`; ids never handed out fail with `ChannelNotFound`.
    pub fn get_channel(&self, id: &ChannelId) -> Result<Arc<ChannelHandle>, ChannelError> {
        match self.registry.get(&id.session) {
            Some(session) => session.channel(id.local),
            None if self.registry.is_retired(&id.session) => {
                Err(ChannelError::Closed(id.to_string()))
            }
            None => Err(ChannelError::NotFound(id.to_string())),
        }
    }

    /// Look up the open channel with a purpose
    pub fn get_by_purpose(
        &self,
        session_id: &SessionId,
        purpose: ChannelPurpose,
    ) -> Result<Arc<ChannelHandle>, ChannelError> {
        let name = format!("{}/{}", session_id, purpose);
        let session = match self.registry.get(session_id) {
            Some(session) => session,
            None if self.registry.is_retired(session_id) => {
                return Err(ChannelError::Closed(name));
            }
            None => return Err(ChannelError::NotFound(name)),
        };
        if session.state().is_terminal() {
            return Err(ChannelError::Closed(name));
        }
        session
            .channel_by_purpose(purpose)
            .ok_or(ChannelError::NotFound(name))
    }

    /// Queue bytes on a channel
    pub async fn write(&self, id: &ChannelId, data: Bytes) -> Result<(), ChannelError> {
        tracing::trace!("write {} bytes to {}", data.len(), id);
        self.get_channel(id)?.write(data).await
    }

    /// Queue bytes on the channel of a session with a purpose
    pub async fn write_to(
        &self,
        session_id: &SessionId,
        purpose: ChannelPurpose,
        data: Bytes,
    ) -> Result<(), ChannelError> {
        self.get_by_purpose(session_id, purpose)?.write(data).await
    }

    /// Resize a shell channel
    pub async fn resize(&self, id: &ChannelId, size: TerminalSize) -> Result<(), ChannelError> {
        self.get_channel(id)?.resize(size).await
    }

    /// Resize the shell of a session
    pub async fn resize_shell(
        &self,
        session_id: &SessionId,
        size: TerminalSize,
    ) -> Result<(), ChannelError> {
        self.get_by_purpose(session_id, ChannelPurpose::Shell)?
            .resize(size)
            .await
    }

    /// Close one channel; siblings stay open. Idempotent.
    pub fn close_channel(&self, id: &ChannelId) -> Result<(), ChannelError> {
        match self.get_channel(id) {
            Ok(channel) => {
                channel.close();
                Ok(())
            }
            Err(ChannelError::Closed(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Register a consumer on a channel
    pub fn subscribe(&self, id: &ChannelId) -> Result<mpsc::Receiver<ShellEvent>, ChannelError> {
        Ok(self.get_channel(id)?.subscribe())
    }
}
