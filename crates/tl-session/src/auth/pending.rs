//! Resolve-once table of requests waiting on a human
//!
//! Each pending entry is resolved by whichever of answer, cancel or deadline
//! gets there first. Removing the entry from the map is the single
//! transition point, so a late answer after a timeout (or a timeout racing an
//! answer) is a harmless no-op.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::oneshot;

use tl_core::error::ChallengeError;

/// How a pending request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<T> {
    /// The user answered
    Answered(T),
    /// The user cancelled (or the owner went away)
    Cancelled,
    /// The deadline passed
    TimedOut,
}

struct PendingEntry<T> {
    owner: String,
    tx: oneshot::Sender<Resolution<T>>,
}

/// A request waiting for its resolution
pub struct PendingTicket<K, T> {
    id: K,
    rx: oneshot::Receiver<Resolution<T>>,
}

impl<K, T> PendingTicket<K, T> {
    /// Id of the request
    pub fn id(&self) -> &K {
        &self.id
    }
}

/// Pending requests keyed by id, at most one per owner
pub struct PendingTable<K, T> {
    entries: DashMap<K, PendingEntry<T>>,
    owners: DashMap<String, K>,
}

impl<K, T> PendingTable<K, T>
where
    K: Eq + Hash + Clone + Display,
{
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    /// Register a pending request for `owner`.
    ///
    /// Fails if the owner already has one outstanding.
    pub fn open(&self, owner: &str, id: K) -> Result<PendingTicket<K, T>, ChallengeError> {
        match self.owners.entry(owner.to_string()) {
            Entry::Occupied(_) => Err(ChallengeError::Outstanding(owner.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
                let (tx, rx) = oneshot::channel();
                self.entries.insert(
                    id.clone(),
                    PendingEntry {
                        owner: owner.to_string(),
                        tx,
                    },
                );
                Ok(PendingTicket { id, rx })
            }
        }
    }

    /// Deliver an answer
    pub fn answer(&self, id: &K, value: T) -> Result<(), ChallengeError> {
        self.finish(id, Resolution::Answered(value))
    }

    /// Cancel a request
    pub fn cancel(&self, id: &K) -> Result<(), ChallengeError> {
        self.finish(id, Resolution::Cancelled)
    }

    /// Cancel whatever `owner` has outstanding. Returns whether anything was
    /// cancelled.
    pub fn cancel_owner(&self, owner: &str) -> bool {
        let id = self.owners.get(owner).map(|id| id.value().clone());
        match id {
            Some(id) => self.cancel(&id).is_ok(),
            None => false,
        }
    }

    /// Wait for the request to resolve, at most `timeout`
    pub async fn wait(&self, ticket: PendingTicket<K, T>, timeout: Duration) -> Resolution<T> {
        let PendingTicket { id, mut rx } = ticket;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Resolution::Cancelled,
            Err(_) => {
                if self.take(&id).is_some() {
                    tracing::debug!("Pending request {} timed out", id);
                    Resolution::TimedOut
                } else {
                    // Resolved concurrently with the deadline; the value is
                    // already on its way.
                    rx.await.unwrap_or(Resolution::Cancelled)
                }
            }
        }
    }

    /// Whether a request is still pending
    pub fn is_pending(&self, id: &K) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn finish(&self, id: &K, resolution: Resolution<T>) -> Result<(), ChallengeError> {
        let entry = self
            .take(id)
            .ok_or_else(|| ChallengeError::Unknown(id.to_string()))?;
        // The waiter may have gone away; that still counts as resolved.
        let _ = entry.tx.send(resolution);
        Ok(())
    }

    fn take(&self, id: &K) -> Option<PendingEntry<T>> {
        let (_, entry) = self.entries.remove(id)?;
        self.owners.remove_if(&entry.owner, |_, current| current == id);
        Some(entry)
    }
}

impl<K, T> Default for PendingTable<K, T>
where
    K: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tl_protocol::ChallengeId;

    #[tokio::test]
    async fn test_answer_resolves() {
        let table: PendingTable<ChallengeId, Vec<String>> = PendingTable::new();
        let ticket = table.open("s#0", ChallengeId::new("c1")).unwrap();
        table
            .answer(&ChallengeId::new("c1"), vec!["123456".into()])
            .unwrap();

        let resolution = table.wait(ticket, Duration::from_secs(30)).await;
        assert_eq!(resolution, Resolution::Answered(vec!["123456".to_string()]));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_second_request_for_owner_is_rejected() {
        let table: PendingTable<ChallengeId, Vec<String>> = PendingTable::new();
        let _first = table.open("s#0", ChallengeId::new("c1")).unwrap();
        let second = table.open("s#0", ChallengeId::new("c2"));
        assert!(matches!(second, Err(ChallengeError::Outstanding(_))));

        // A different owner is independent.
        assert!(table.open("other#0", ChallengeId::new("c3")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_answer_is_noop() {
        let table: Arc<PendingTable<ChallengeId, Vec<String>>> = Arc::new(PendingTable::new());
        let ticket = table.open("s#0", ChallengeId::new("c1")).unwrap();

        let resolution = table.wait(ticket, Duration::from_secs(30)).await;
        assert_eq!(resolution, Resolution::TimedOut);

        let late = table.answer(&ChallengeId::new("c1"), vec![]);
        assert!(matches!(late, Err(ChallengeError::Unknown(_))));

        // The owner slot is free again.
        assert!(table.open("s#0", ChallengeId::new("c2")).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_owner() {
        let table: PendingTable<ChallengeId, Vec<String>> = PendingTable::new();
        let ticket = table.open("s#1", ChallengeId::new("c1")).unwrap();
        assert!(table.cancel_owner("s#1"));
        assert!(!table.cancel_owner("s#1"));

        let resolution = table.wait(ticket, Duration::from_secs(30)).await;
        assert_eq!(resolution, Resolution::Cancelled);
    }

    #[tokio::test]
    async fn test_double_resolution_only_first_wins() {
        let table: PendingTable<ChallengeId, Vec<String>> = PendingTable::new();
        let ticket = table.open("s#0", ChallengeId::new("c1")).unwrap();
        table.cancel(&ChallengeId::new("c1")).unwrap();
        assert!(table.answer(&ChallengeId::new("c1"), vec![]).is_err());

        let resolution = table.wait(ticket, Duration::from_secs(30)).await;
        assert_eq!(resolution, Resolution::Cancelled);
    }
}
