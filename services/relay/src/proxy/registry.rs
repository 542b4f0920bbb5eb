//! Registry of live sessions.
//!
//! Reads (listing, lookup, kill) never block writers: the map is swapped
//! copy-on-write, and concurrent updates retry against the latest version.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use super::session::{Session, SessionId, SessionInfo};

type SessionMap = HashMap<SessionId, Arc<Session>>;

/// Live sessions keyed by id.
#[derive(Debug)]
pub struct ConnectionRegistry {
    sessions: ArcSwap<SessionMap>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn put(&self, session: Arc<Session>) {
        let id = session.id();
        self.sessions.rcu(|current| {
            let mut next = SessionMap::clone(current);
            next.insert(id, Arc::clone(&session));
            next
        });
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let previous = self.sessions.rcu(|current| {
            let mut next = SessionMap::clone(current);
            next.remove(id);
            next
        });
        previous.get(id).cloned()
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.load().get(id).cloned()
    }

    /// Snapshot of all live sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.load();
        let mut live: Vec<&Arc<Session>> = sessions.values().collect();
        live.sort_by_key(|s| (s.started_at(), s.id()));
        live.iter().map(|s| s.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark a session for termination.
    ///
    /// The session stays registered until its handler tears it down, which
    /// happens within one supervisor interval. Returns `false` for unknown
    /// ids and sessions already being torn down.
    pub fn kill(&self, id: &SessionId) -> bool {
        let Some(session) = self.get(id) else {
            info!(session_id = %id, "Kill requested for unknown session");
            return false;
        };

        let killed = session.kill();
        if killed {
            info!(
                session_id = %id,
                cookie = %session.cookie(),
                client = %session.client(),
                "Session killed by operator"
            );
        } else {
            info!(session_id = %id, "Session already terminating");
        }
        killed
    }

    /// Number of registered sessions whose liveness flag is still set.
    pub fn alive_count(&self) -> usize {
        self.sessions
            .load()
            .values()
            .filter(|s| s.is_alive())
            .count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
