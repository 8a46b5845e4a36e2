//! Session manager (C2, spec §4.2): identity derivation, lifecycle
//! transitions, idle sweep, blocklist coordination.

use std::sync::Arc;
use time::OffsetDateTime;

use crate::durable::{DurableWriter, FlaggedSessionRecord};
use crate::error::SessionError;
use crate::session::blocklist::{BlockMode, Blocklist};
use crate::session::store::{SessionHandle, SessionStore};
use crate::session::types::{Session, SessionState};

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    blocklist: Blocklist,
    durable: Arc<dyn DurableWriter>,
    pub block_mode: BlockMode,
    pub idle_timeout_secs: i64,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        durable: Arc<dyn DurableWriter>,
        block_mode: BlockMode,
        idle_timeout_secs: i64,
    ) -> Self {
        Self {
            store,
            blocklist: Blocklist::new(),
            durable,
            block_mode,
            idle_timeout_secs,
        }
    }

    /// Derive the per-(client, backend) identity: `client-<hash>-<backend>`.
    pub fn client_hash(client_addr: &str) -> String {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        client_addr.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    pub fn derive_client_session_id(client_addr: &str, backend: &str) -> String {
        format!("client-{}-{}", Self::client_hash(client_addr), backend)
    }

    /// Open Question — blocklist granularity (spec §3/§9 vs §8 scenario 5):
    /// spec §3 and §9 describe the blocklist as keyed on "the client-hash
    /// component" alone, which would make killing one of a client's
    /// per-backend sessions block every backend-specific session derived
    /// from that client. Spec §8 scenario 5 contradicts this directly:
    /// "Two requests from the same client address... produce two distinct
    /// sessions `client-<h>-openai` and `client-<h>-anthropic`... Killing
    /// one does not affect the other." Scenario 5's literal, worked
    /// expectation is taken as authoritative — the blocklist is keyed on
    /// the *full* session identity (the whole derived id, or the whole
    /// operator-supplied id), so a kill on one backend-specific session
    /// never blocks a sibling session for the same client on a different
    /// backend. An operator-supplied id is its own key either way, since it
    /// carries no backend segment to isolate.
    fn blocklist_key(session_id: &str) -> String {
        session_id.to_string()
    }

    /// spec §4.2 `get_or_create`. Returns `None` when the id exists and is
    /// killed (handler must return 403) or the client is blocked.
    pub async fn get_or_create(
        &self,
        id: &str,
        backend: &str,
        client_addr: &str,
    ) -> Result<Option<SessionHandle>, SessionError> {
        let now = OffsetDateTime::now_utc();

        if self
            .blocklist
            .is_blocked(&Self::blocklist_key(id), now)
            .await
        {
            return Ok(None);
        }

        if let Some(handle) = self.store.get(id).await {
            let state = handle.read().await.state;
            match state {
                SessionState::Terminated | SessionState::TimedOut | SessionState::Completed => {
                    return Err(SessionError::Terminated(id.to_string()));
                }
                SessionState::Killed => return Ok(None),
                SessionState::Active => return Ok(Some(handle)),
            }
        }

        let session = Session::new(id.to_string(), backend.to_string(), client_addr.to_string(), now);
        let handle = self.store.put(session).await;
        Ok(Some(handle))
    }

    pub async fn get_or_create_by_client(
        &self,
        client_addr: &str,
        backend_name: &str,
    ) -> Result<Option<SessionHandle>, SessionError> {
        let id = Self::derive_client_session_id(client_addr, backend_name);
        self.get_or_create(&id, backend_name, client_addr).await
    }

    /// spec §4.2 `kill`.
    pub async fn kill(&self, id: &str) -> Result<(), SessionError> {
        let handle = self
            .store
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        let (client_key, record) = {
            let mut session = handle.write().await;
            session.state = SessionState::Killed;
            session.ended_at = Some(OffsetDateTime::now_utc());
            session.kill_signal.close();
            (
                Self::blocklist_key(&session.id),
                FlaggedSessionRecord::from(&*session),
            )
        };

        self.blocklist
            .insert(client_key, self.block_mode, OffsetDateTime::now_utc())
            .await;
        self.durable.write_flagged(record).await;
        Ok(())
    }

    /// spec §4.2 `resume`. Only permitted from `killed`; rejects otherwise.
    pub async fn resume(&self, id: &str) -> Result<(), SessionError> {
        let handle = self
            .store
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        let client_key = {
            let mut session = handle.write().await;
            if session.state != SessionState::Killed {
                return Err(SessionError::NotKilled(id.to_string()));
            }
            session.state = SessionState::Active;
            session.ended_at = None;
            session.kill_signal = crate::session::types::KillSignal::new();
            Self::blocklist_key(&session.id)
        };

        self.blocklist.remove(&client_key).await;
        Ok(())
    }

    /// spec §4.2 `terminate`. Irreversible.
    pub async fn terminate(&self, id: &str) -> Result<(), SessionError> {
        let handle = self
            .store
            .get(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        let record = {
            let mut session = handle.write().await;
            session.state = SessionState::Terminated;
            session.ended_at = Some(OffsetDateTime::now_utc());
            session.kill_signal.close();
            FlaggedSessionRecord::from(&*session)
        };
        self.durable.write_flagged(record).await;
        // spec §3: "any non-active → completed on final durable write".
        // `terminate` is irreversible, so its durable write is always final.
        handle.write().await.state = SessionState::Completed;
        Ok(())
    }

    /// On first violation — write through regardless of whether the caller
    /// went on to block/terminate, so forensic captures exist even for
    /// blocked requests (spec §7).
    pub async fn write_if_flagged(&self, id: &str) {
        if let Some(handle) = self.store.get(id).await {
            let session = handle.read().await;
            if session.flagged {
                self.durable
                    .write_flagged(FlaggedSessionRecord::from(&*session))
                    .await;
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.store.get(id).await
    }

    /// Idle sweep (spec §4.2, §5): terminate sessions whose last-activity
    /// time exceeds the configured idle timeout. Returns the ids swept.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let now = OffsetDateTime::now_utc();
        let mut swept = Vec::new();
        for handle in self.store.list(true).await {
            let (should_sweep, id) = {
                let session = handle.read().await;
                let idle_secs = (now - session.last_activity_at).whole_seconds();
                (idle_secs > self.idle_timeout_secs, session.id.clone())
            };
            if should_sweep {
                let record = {
                    let mut session = handle.write().await;
                    session.state = SessionState::TimedOut;
                    session.ended_at = Some(now);
                    session.kill_signal.close();
                    FlaggedSessionRecord::from(&*session)
                };
                self.durable.write_flagged(record).await;
                // spec §3: idle timeout is irreversible, so this write is final.
                handle.write().await.state = SessionState::Completed;
                swept.push(id);
            }
        }
        swept
    }

    pub async fn terminate_all(&self) {
        for handle in self.store.list(true).await {
            let record = {
                let mut session = handle.write().await;
                session.state = SessionState::Terminated;
                session.ended_at = Some(OffsetDateTime::now_utc());
                session.kill_signal.close();
                FlaggedSessionRecord::from(&*session)
            };
            self.durable.write_flagged(record).await;
            // spec §3: shutdown termination is final for every session.
            handle.write().await.state = SessionState::Completed;
        }
    }
}

/// Ticker-driven idle sweeper (spec §5: "idle sweeper runs on a ticker,
/// interval = configured idle timeout").
pub async fn run_idle_sweeper(manager: Arc<SessionManager>) {
    let interval = std::time::Duration::from_secs(manager.idle_timeout_secs.max(1) as u64);
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let swept = manager.sweep_idle().await;
        if !swept.is_empty() {
            tracing::info!(count = swept.len(), "idle sweep terminated sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::InMemoryDurableWriter;
    use crate::session::store::InMemorySessionStore;

    fn manager(idle_timeout_secs: i64) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            InMemorySessionStore::new(),
            InMemoryDurableWriter::new(),
            BlockMode::Duration,
            idle_timeout_secs,
        ))
    }

    /// spec §8: killed session id is blocked (`get_or_create` returns
    /// `None`) until a new request arrives under the client key after
    /// `resume` — this is the literal "kill then resume" scenario.
    #[tokio::test]
    async fn kill_then_get_or_create_returns_none() {
        let mgr = manager(3600);
        let handle = mgr
            .get_or_create("sess-A", "openai", "1.2.3.4:1")
            .await
            .unwrap()
            .unwrap();
        handle.write().await.counters.request_count = 2;

        mgr.kill("sess-A").await.unwrap();
        assert!(mgr
            .get_or_create("sess-A", "openai", "1.2.3.4:1")
            .await
            .unwrap()
            .is_none());
    }

    /// spec §8 law: resume is the left inverse of kill on active sessions —
    /// counters are preserved and a fresh kill signal is issued.
    #[tokio::test]
    async fn resume_is_left_inverse_of_kill() {
        let mgr = manager(3600);
        let handle = mgr
            .get_or_create("sess-A", "openai", "1.2.3.4:1")
            .await
            .unwrap()
            .unwrap();
        handle.write().await.counters.request_count = 2;
        let kill_signal_before = handle.read().await.kill_signal.clone();

        mgr.kill("sess-A").await.unwrap();
        assert!(kill_signal_before.is_closed());

        mgr.resume("sess-A").await.unwrap();
        let session = handle.read().await;
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(session.counters.request_count, 2);
        assert!(!session.kill_signal.is_closed());
        drop(session);

        let resumed = mgr
            .get_or_create("sess-A", "openai", "1.2.3.4:1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resumed.read().await.state, SessionState::Active);
    }

    /// resume only applies from `killed` (spec §4.2): resuming an active
    /// session is rejected.
    #[tokio::test]
    async fn resume_rejects_non_killed_session() {
        let mgr = manager(3600);
        mgr.get_or_create("sess-A", "openai", "1.2.3.4:1").await.unwrap();
        assert!(mgr.resume("sess-A").await.is_err());
    }

    /// A terminated session id is never reusable under the same identity
    /// (spec §3 invariant, §8 boundary behavior).
    #[tokio::test]
    async fn terminated_session_id_is_not_reusable() {
        let mgr = manager(3600);
        let handle = mgr
            .get_or_create("sess-A", "openai", "1.2.3.4:1")
            .await
            .unwrap()
            .unwrap();
        mgr.terminate("sess-A").await.unwrap();
        assert!(matches!(
            mgr.get_or_create("sess-A", "openai", "1.2.3.4:1").await,
            Err(crate::error::SessionError::Terminated(_))
        ));
        // spec §3: the durable write for an irreversible transition is
        // final, so the session settles on `completed`.
        assert_eq!(handle.read().await.state, SessionState::Completed);
    }

    /// spec §8: idle sweep terminates exactly the sessions whose
    /// last-activity time is older than the configured idle timeout.
    #[tokio::test]
    async fn idle_sweep_terminates_only_stale_sessions() {
        let mgr = manager(3600);
        let stale = mgr.get_or_create("stale", "openai", "1.1.1.1:1").await.unwrap().unwrap();
        let fresh = mgr.get_or_create("fresh", "openai", "2.2.2.2:1").await.unwrap().unwrap();

        {
            let mut s = stale.write().await;
            s.last_activity_at = OffsetDateTime::now_utc() - time::Duration::seconds(7200);
        }

        let swept = mgr.sweep_idle().await;
        assert_eq!(swept, vec!["stale".to_string()]);
        // spec §3: the idle-sweep durable write is final, so the session
        // lands on `completed`, not `timed_out`.
        assert_eq!(stale.read().await.state, SessionState::Completed);
        assert_eq!(fresh.read().await.state, SessionState::Active);
    }

    /// spec §9: the two derived ids for one client across two backends
    /// share only the client-hash segment.
    #[tokio::test]
    async fn derived_ids_differ_per_backend_for_same_client() {
        let a = SessionManager::derive_client_session_id("9.9.9.9:1", "openai");
        let b = SessionManager::derive_client_session_id("9.9.9.9:1", "anthropic");
        assert_ne!(a, b);
        assert!(a.starts_with("client-"));
        assert!(a.ends_with("-openai"));
        assert!(b.ends_with("-anthropic"));
    }

    /// spec §8 scenario 5, literally: killing a client's session on one
    /// backend must not block that same client's session on another
    /// backend. This is the behavior the blocklist-granularity Open
    /// Question resolves in favor of over spec §3/§9's client-hash-only
    /// reading.
    #[tokio::test]
    async fn killing_one_backend_session_does_not_block_sibling_backend_session() {
        let mgr = manager(3600);
        let openai_id = SessionManager::derive_client_session_id("9.9.9.9:1", "openai");
        let anthropic_id = SessionManager::derive_client_session_id("9.9.9.9:1", "anthropic");

        mgr.get_or_create(&openai_id, "openai", "9.9.9.9:1").await.unwrap();
        mgr.get_or_create(&anthropic_id, "anthropic", "9.9.9.9:1")
            .await
            .unwrap();

        mgr.kill(&openai_id).await.unwrap();

        assert!(mgr
            .get_or_create(&openai_id, "openai", "9.9.9.9:1")
            .await
            .unwrap()
            .is_none());

        let sibling = mgr
            .get_or_create(&anthropic_id, "anthropic", "9.9.9.9:1")
            .await
            .unwrap();
        assert!(sibling.is_some());
        assert_eq!(sibling.unwrap().read().await.state, SessionState::Active);
    }
}
