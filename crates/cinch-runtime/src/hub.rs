use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::session::{ServerMessage, SessionHandle};

/// In-memory registry of live worker sessions. The Hub is the sole owner of
/// the live session set; it holds no back-pointer to the Dispatcher or to
/// any session's internals beyond the handle needed to send it a message.
///
/// A single mutex protects the session-id map; the label and owner indices
/// below are derived views recomputed from it, kept consistent by always
/// being read under the same lock rather than updated incrementally.
pub struct Hub {
    sessions: Mutex<HashMap<Uuid, SessionHandle>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts a session, closing and replacing any prior session registered
    /// under the same worker id (the later `register` always wins).
    pub fn register(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(old) = sessions.insert(handle.worker_id, handle) {
            old.close("superseded by a newer registration for the same worker id");
        }
    }

    /// Removes `handle` iff it is still the session registered for its
    /// worker id — guards against a reconnected successor's unregister
    /// racing the predecessor's teardown.
    pub fn unregister(&self, handle: &SessionHandle) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(current) = sessions.get(&handle.worker_id) {
            if current.id == handle.id {
                sessions.remove(&handle.worker_id);
            }
        }
    }

    pub fn get(&self, worker_id: Uuid) -> Option<SessionHandle> {
        self.sessions.lock().unwrap().get(&worker_id).cloned()
    }

    /// Returns an online session whose label set is a superset of
    /// `labels_required` and which accepts the candidate via `predicate`.
    /// Ordering: round-robin within the matched set, ties broken by
    /// least-recent assignment.
    pub fn match_session<F>(&self, labels_required: &[String], predicate: F) -> Option<SessionHandle>
    where
        F: Fn(&SessionHandle) -> bool,
    {
        let sessions = self.sessions.lock().unwrap();
        let mut candidates: Vec<&SessionHandle> = sessions
            .values()
            .filter(|s| {
                s.is_available()
                    && labels_required.iter().all(|l| s.labels.contains(l))
                    && predicate(s)
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|s| s.last_assigned_at());
        Some(candidates[0].clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Sends `msg` to every currently registered session. Used during
    /// shutdown to broadcast `GracefulShutdown` before the process exits.
    pub fn broadcast(&self, msg: ServerMessage) {
        let sessions = self.sessions.lock().unwrap();
        for session in sessions.values() {
            session.send(msg.clone());
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::fake_session;

    #[test]
    fn register_replaces_and_closes_prior_session() {
        let hub = Hub::new();
        let worker_id = Uuid::new_v4();
        let first = fake_session(worker_id, &["linux"]);
        let first_clone = first.clone();
        hub.register(first);
        let second = fake_session(worker_id, &["linux"]);
        hub.register(second);

        assert!(first_clone.is_closed());
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn unregister_ignores_stale_handle_after_reconnect() {
        let hub = Hub::new();
        let worker_id = Uuid::new_v4();
        let first = fake_session(worker_id, &["linux"]);
        let first_clone = first.clone();
        hub.register(first);
        let second = fake_session(worker_id, &["linux"]);
        hub.register(second);

        hub.unregister(&first_clone);
        assert_eq!(hub.len(), 1, "unregister of superseded handle must not evict the successor");
    }

    #[test]
    fn match_requires_label_superset() {
        let hub = Hub::new();
        let session = fake_session(Uuid::new_v4(), &["linux", "amd64"]);
        hub.register(session);

        assert!(hub.match_session(&["linux".to_string()], |_| true).is_some());
        assert!(hub
            .match_session(&["linux".to_string(), "arm64".to_string()], |_| true)
            .is_none());
    }
}
