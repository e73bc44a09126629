//! Session registry: the single source of truth for live sessions.
//!
//! Every operation takes the lock once, mutates or reads the map, and
//! releases it. Nothing in here awaits or touches a session's I/O; callers
//! close sessions after taking them out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::SessionId;
use crate::session::Session;

/// A registered session and the handles of the tasks bound to it.
#[derive(Clone)]
pub(crate) struct SessionEntry {
    pub session: Arc<dyn Session>,
    /// Feeds the session's input task, preserving arrival order.
    pub input: mpsc::UnboundedSender<Vec<u8>>,
    /// Stops the session's output pump and input feeder.
    pub cancel: CancellationToken,
    /// Distinguishes incarnations of the same id.
    pub epoch: u64,
}

pub(crate) enum Insert {
    Inserted,
    /// The id is already taken; the caller's entry is handed back.
    Occupied {
        existing: SessionEntry,
        rejected: SessionEntry,
    },
    /// The registry was drained for shutdown.
    Closed { rejected: SessionEntry },
}

#[derive(Default)]
struct Sessions {
    map: HashMap<SessionId, SessionEntry>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct SessionRegistry {
    inner: Mutex<Sessions>,
    next_epoch: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn insert_if_absent(&self, id: SessionId, entry: SessionEntry) -> Insert {
        let mut sessions = self.lock();
        if sessions.closed {
            return Insert::Closed { rejected: entry };
        }
        if let Some(existing) = sessions.map.get(&id) {
            return Insert::Occupied {
                existing: existing.clone(),
                rejected: entry,
            };
        }
        sessions.map.insert(id, entry);
        Insert::Inserted
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionEntry> {
        self.lock().map.get(id).cloned()
    }

    pub fn remove(&self, id: &SessionId) -> Option<SessionEntry> {
        self.lock().map.remove(id)
    }

    /// Remove `id` only if it is still the incarnation identified by `epoch`.
    pub fn remove_if_epoch(&self, id: &SessionId, epoch: u64) -> Option<SessionEntry> {
        let mut sessions = self.lock();
        match sessions.map.get(id) {
            Some(entry) if entry.epoch == epoch => sessions.map.remove(id),
            _ => None,
        }
    }

    /// Take every entry out and refuse further inserts.
    pub fn drain(&self) -> Vec<(SessionId, SessionEntry)> {
        let mut sessions = self.lock();
        sessions.closed = true;
        sessions.map.drain().collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.lock().map.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.lock().map.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::FakeSession;

    fn entry(registry: &SessionRegistry) -> SessionEntry {
        let (input, _rx) = mpsc::unbounded_channel();
        let (session, _output) = FakeSession::new();
        SessionEntry {
            session,
            input,
            cancel: CancellationToken::new(),
            epoch: registry.next_epoch(),
        }
    }

    #[test]
    fn insert_never_overwrites() {
        let registry = SessionRegistry::new();
        let first = entry(&registry);
        let first_epoch = first.epoch;
        assert!(matches!(
            registry.insert_if_absent("S1".into(), first),
            Insert::Inserted
        ));

        match registry.insert_if_absent("S1".into(), entry(&registry)) {
            Insert::Occupied { existing, rejected } => {
                assert_eq!(existing.epoch, first_epoch);
                assert_ne!(rejected.epoch, first_epoch);
            }
            _ => panic!("expected Occupied"),
        }
        assert_eq!(registry.get(&"S1".into()).unwrap().epoch, first_epoch);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_epoch_does_not_remove_newer_incarnation() {
        let registry = SessionRegistry::new();
        let old = entry(&registry);
        let old_epoch = old.epoch;
        registry.insert_if_absent("S1".into(), old);
        registry.remove(&"S1".into());

        let new = entry(&registry);
        let new_epoch = new.epoch;
        registry.insert_if_absent("S1".into(), new);

        assert!(registry.remove_if_epoch(&"S1".into(), old_epoch).is_none());
        assert!(registry.contains(&"S1".into()));
        assert!(registry.remove_if_epoch(&"S1".into(), new_epoch).is_some());
        assert!(!registry.contains(&"S1".into()));
    }

    #[test]
    fn drain_empties_and_closes() {
        let registry = SessionRegistry::new();
        registry.insert_if_absent("S1".into(), entry(&registry));
        registry.insert_if_absent("S2".into(), entry(&registry));
        assert_eq!(registry.ids(), vec![SessionId::from("S1"), SessionId::from("S2")]);

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.len(), 0);
        assert!(registry.drain().is_empty());

        assert!(matches!(
            registry.insert_if_absent("S3".into(), entry(&registry)),
            Insert::Closed { .. }
        ));
        assert_eq!(registry.len(), 0);
    }
}
