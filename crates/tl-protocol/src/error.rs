//! Protocol error types

use thiserror::Error;

/// Errors that can occur while parsing boundary payloads
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Channel id string is not of the form `<session>/<n>`
    #[error("Invalid channel id: {0}")]
    InvalidChannelId(String),

    /// Malformed JSON payload
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
