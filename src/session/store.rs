//! Session store (C1, spec §4.1): `get`/`put`/`delete`/`list` behind a trait,
//! with an in-memory implementation. The external key-value store described
//! in spec §4.1 (for horizontal scaling, with pub/sub kill propagation) is
//! represented by the same trait boundary; an adapter on top of Redis is out
//! of scope per spec §1 Non-goals, so only the in-memory implementation
//! ships here.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::session::types::Session;

/// A session mutates under its own lock (spec §5), so the store hands out a
/// shared handle rather than a snapshot — mutations by any request handler
/// holding the handle are immediately visible to every other holder,
/// matching spec §4.1's "live session object" contract.
pub type SessionHandle = Arc<RwLock<Session>>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Option<SessionHandle>;
    async fn put(&self, session: Session) -> SessionHandle;
    async fn delete(&self, id: &str);
    async fn list(&self, active_only: bool) -> Vec<SessionHandle>;
}

/// In-memory store: a mapping from identifier to session handle behind a
/// coarse read-write lock (spec §5 "the session store's map is guarded by a
/// coarse read-write lock; hot paths (`get`) take a read lock, `put`/`delete`
/// take write").
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    async fn put(&self, session: Session) -> SessionHandle {
        let handle = Arc::new(RwLock::new(session));
        let id = handle.read().await.id.clone();
        self.sessions.write().await.insert(id, handle.clone());
        handle
    }

    async fn delete(&self, id: &str) {
        self.sessions.write().await.remove(id);
    }

    async fn list(&self, active_only: bool) -> Vec<SessionHandle> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::new();
        for handle in sessions.values() {
            if !active_only || handle.read().await.is_active() {
                out.push(handle.clone());
            }
        }
        out
    }
}
