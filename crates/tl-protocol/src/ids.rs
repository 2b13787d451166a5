//! Identifier types
//!
//! Session ids are supplied by the caller (one per UI tab or panel). Channel
//! ids embed their session so that a bare channel id is enough to route a
//! write or resize. Challenge, selection and task ids are generated by the
//! core and correlate asynchronous request/response pairs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Caller-supplied identifier for a logical connection target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a new session ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random session ID (used for local shells opened without one)
    pub fn generate() -> Self {
        Self(format!("local-{}", uuid::Uuid::new_v4()))
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a channel: its session plus a number unique within that
/// session's transport.
///
/// Rendered as `<session>/<n>`. Session ids may themselves contain `/`, so
/// parsing splits on the last separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId {
    /// Owning session
    pub session: SessionId,
    /// Number unique within the session
    pub local: u32,
}

impl ChannelId {
    /// Create a new channel ID
    pub fn new(session: SessionId, local: u32) -> Self {
        Self { session, local }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session, self.local)
    }
}

impl FromStr for ChannelId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (session, local) = s
            .rsplit_once('/')
            .ok_or_else(|| ProtocolError::InvalidChannelId(s.to_string()))?;
        if session.is_empty() {
            return Err(ProtocolError::InvalidChannelId(s.to_string()));
        }
        let local = local
            .parse::<u32>()
            .map_err(|_| ProtocolError::InvalidChannelId(s.to_string()))?;
        Ok(Self::new(SessionId::new(session), local))
    }
}

impl TryFrom<String> for ChannelId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.to_string()
    }
}

macro_rules! generated_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh random ID
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{}"), uuid::Uuid::new_v4()))
            }

            /// Wrap an existing ID string
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the raw ID string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

generated_id!(
    /// Correlates one keyboard-interactive prompt round with its answer
    ChallengeId,
    "kbi"
);

generated_id!(
    /// Correlates one jump-server account selection with its answer
    SelectionId,
    "sel"
);

generated_id!(
    /// Identifies one file transfer for progress reporting and cancellation
    TaskKey,
    "task"
);
