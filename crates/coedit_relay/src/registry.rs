//! Session registry
//!
//! Maps session ids to live [`Session`]s. The map has its own lock, separate
//! from every session's lock; the two are never held at the same time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::ids::{IdGenerator, UuidGenerator};
use crate::metrics;
use crate::session::{JoinError, LeaveOutcome, Session};

const MAX_ID_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("id generator produced {0} colliding ids in a row")]
    IdsExhausted(usize),
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    ids: Arc<dyn IdGenerator>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_generator(Arc::new(UuidGenerator))
    }

    pub fn with_generator(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ids,
        }
    }

    /// Create a session hosted by `creator` and make it visible.
    pub fn create(
        &self,
        password: &str,
        creator: ConnectionHandle,
    ) -> Result<Arc<Session>, RegistryError> {
        let creator_id = creator.id();
        let mut sessions = self.sessions.lock();

        let mut attempts = 0;
        let id = loop {
            if attempts == MAX_ID_ATTEMPTS {
                return Err(RegistryError::IdsExhausted(attempts));
            }
            attempts += 1;
            let candidate = self.ids.generate();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
            warn!(id = %candidate, "Session id collision, retrying");
        };

        let session = Arc::new(Session::new(id.clone(), password.to_string(), creator));
        sessions.insert(id.clone(), session.clone());
        drop(sessions);

        metrics::session_opened();
        info!(session = %id, host = %creator_id, "Created session");
        Ok(session)
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Drop `id` from the registry. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.lock().remove(id).is_some();
        if removed {
            metrics::session_closed();
            info!(session = %id, "Removed session");
        }
        removed
    }

    /// Look up `id` and admit `conn` to it.
    pub fn join(
        &self,
        id: &str,
        conn: ConnectionHandle,
        password: &str,
    ) -> Result<Arc<Session>, JoinError> {
        let session = self.lookup(id).ok_or(JoinError::InvalidId)?;
        session.join(conn, password)?;
        Ok(session)
    }

    /// Remove `conn` from `session`, dropping the session once it is empty.
    pub fn leave(&self, session: &Session, conn: ConnectionId) -> LeaveOutcome {
        let outcome = session.leave(conn);
        if outcome == LeaveOutcome::Emptied {
            self.remove(session.id());
        }
        outcome
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handle() -> ConnectionHandle {
        // Receivers are dropped; nothing in these tests writes to connections.
        ConnectionHandle::channel(None, 1).0
    }

    #[derive(Debug)]
    struct FixedIds {
        ids: Vec<&'static str>,
        next: AtomicUsize,
    }

    impl IdGenerator for FixedIds {
        fn generate(&self) -> String {
            let i = self.next.fetch_add(1, Ordering::Relaxed);
            self.ids[i.min(self.ids.len() - 1)].to_string()
        }
    }

    #[test]
    fn test_session_lifecycle() {
        let registry = SessionRegistry::new();
        let host = handle();
        let guest = handle();

        let session = registry.create("pw", host.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(session.id()).is_some());

        let joined = registry.join(session.id(), guest.clone(), "pw").unwrap();
        assert!(Arc::ptr_eq(&joined, &session));

        registry.leave(&session, host.id());
        assert_eq!(registry.len(), 1);
        assert_eq!(session.host_id(), Some(guest.id()));

        assert_eq!(registry.leave(&session, guest.id()), LeaveOutcome::Emptied);
        assert!(registry.is_empty());
        assert!(registry.lookup(session.id()).is_none());
        assert!(!registry.remove(session.id()));
    }

    #[test]
    fn test_join_unknown_id() {
        let registry = SessionRegistry::new();
        registry.create("pw", handle()).unwrap();
        let before = registry.session_ids();

        assert_eq!(
            registry.join("bogus-id", handle(), "pw").unwrap_err(),
            JoinError::InvalidId
        );
        assert_eq!(registry.session_ids(), before);
    }

    #[test]
    fn test_id_collision_retries() {
        let registry = SessionRegistry::with_generator(Arc::new(FixedIds {
            ids: vec!["a", "a", "b"],
            next: AtomicUsize::new(0),
        }));
        assert_eq!(registry.create("pw", handle()).unwrap().id(), "a");
        assert_eq!(registry.create("pw", handle()).unwrap().id(), "b");
        assert_eq!(
            registry.create("pw", handle()).unwrap_err(),
            RegistryError::IdsExhausted(MAX_ID_ATTEMPTS)
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create { conn: usize },
        Join { conn: usize, session: usize, correct_password: bool },
        Leave { conn: usize },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..6usize).prop_map(|conn| Op::Create { conn }),
            (0..6usize, 0..8usize, any::<bool>()).prop_map(|(conn, session, correct_password)| {
                Op::Join {
                    conn,
                    session,
                    correct_password,
                }
            }),
            (0..6usize).prop_map(|conn| Op::Leave { conn }),
        ]
    }

    proptest! {
        #[test]
        fn prop_registry_holds_exactly_the_non_empty_sessions(ops in prop::collection::vec(op(), 1..60)) {
            let registry = SessionRegistry::new();
            let conns: Vec<ConnectionHandle> = (0..6).map(|_| handle()).collect();
            let mut current: Vec<Option<Arc<Session>>> = vec![None; conns.len()];
            let mut created: Vec<Arc<Session>> = Vec::new();

            for op in ops {
                match op {
                    Op::Create { conn } => {
                        if let Some(prev) = current[conn].take() {
                            registry.leave(&prev, conns[conn].id());
                        }
                        let session = registry.create("pw", conns[conn].clone()).unwrap();
                        created.push(session.clone());
                        current[conn] = Some(session);
                    }
                    Op::Join { conn, session, correct_password } => {
                        if current[conn].is_some() || created.is_empty() {
                            continue;
                        }
                        let target = created[session % created.len()].clone();
                        let host_before = target.host_id();
                        let password = if correct_password { "pw" } else { "wrong" };
                        match registry.join(target.id(), conns[conn].clone(), password) {
                            Ok(joined) => current[conn] = Some(joined),
                            Err(_) => {
                                prop_assert!(!target.contains(conns[conn].id()));
                                prop_assert_eq!(target.host_id(), host_before);
                            }
                        }
                    }
                    Op::Leave { conn } => {
                        if let Some(prev) = current[conn].take() {
                            registry.leave(&prev, conns[conn].id());
                        }
                    }
                }

                for session in &created {
                    let registered = registry.lookup(session.id()).is_some();
                    prop_assert_eq!(registered, !session.is_empty());
                    if let Some(host) = session.host_id() {
                        prop_assert!(session.contains(host));
                    } else {
                        prop_assert!(session.is_empty());
                    }
                }
            }
        }
    }
}
