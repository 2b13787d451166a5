//! Session registry
//!
//! The only shared map of the core. Entries are inserted, replaced and
//! removed under DashMap's shard locks; no lock is held across I/O.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use tl_protocol::SessionId;

use crate::session::Session;

/// Registered sessions by id
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Channel watermark of removed sessions, so their stale channel ids
    /// keep failing with `ChannelClosed`
    retired: DashMap<SessionId, u32>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    ///
    /// A closed or failed session with the same id is replaced. A live one
    /// is kept and returned as the error.
    pub fn register(&self, session: Arc<Session>) -> Result<(), Arc<Session>> {
        match self.sessions.entry(session.id().clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().state().is_terminal() {
                    return Err(entry.get().clone());
                }
                entry.insert(session);
            }
            Entry::Vacant(entry) => {
                entry.insert(session);
            }
        }
        Ok(())
    }

    /// Get a session
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Remove a session, remembering its channel watermark
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        self.retired.insert(id.clone(), session.channel_watermark());
        Some(session)
    }

    /// Remove a session only if it is still the given instance
    pub fn remove_if_same(&self, session: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, s| Arc::ptr_eq(s, session))
            .is_some();
        if removed {
            self.retired
                .insert(session.id().clone(), session.channel_watermark());
        }
        removed
    }

    /// First channel number a new session with this id should use
    pub fn next_channel_number(&self, id: &SessionId) -> u32 {
        let live = self.sessions.get(id).map(|s| s.channel_watermark());
        let retired = self.retired.get(id).map(|w| *w);
        live.into_iter().chain(retired).max().unwrap_or(1)
    }

    /// Whether a session with this id existed and was removed
    pub fn is_retired(&self, id: &SessionId) -> bool {
        self.retired.contains_key(id) && !self.sessions.contains_key(id)
    }

    /// All sessions, ordered by id
    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by(|a, b| a.id().cmp(b.id()));
        sessions
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no session is registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
