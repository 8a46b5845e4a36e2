//! Durable session writer (C9, spec §4.9). The real history store (SQLite
//! schema, Redis specifics) is out of scope per spec §1 Non-goals; this
//! models the write-side contract as a trait so crash-safety invariants
//! (spec §8: "a durable record exists on disk before any subsequent request
//! from the same session completes") are exercised without either backend.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::session::types::{CapturedPair, Session, SessionState, Violation};

/// A projection of the session plus violations plus captured pairs, shaped
/// for the history store (spec §3 "Flagged-session record for persistence").
#[derive(Debug, Clone, Serialize)]
pub struct FlaggedSessionRecord {
    pub session_id: String,
    pub backend: String,
    pub client_addr: String,
    pub state: SessionState,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub request_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub violations: Vec<Violation>,
    pub captures: Vec<CapturedPair>,
}

impl From<&Session> for FlaggedSessionRecord {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.id.clone(),
            backend: s.backend.clone(),
            client_addr: s.client_addr.clone(),
            state: s.state,
            started_at: s.started_at,
            ended_at: s.ended_at,
            request_count: s.counters.request_count,
            bytes_in: s.counters.bytes_in,
            bytes_out: s.counters.bytes_out,
            violations: s.violations.clone(),
            captures: s.captures.clone(),
        }
    }
}

#[async_trait]
pub trait DurableWriter: Send + Sync {
    /// Upsert a flagged session record. Idempotent on `session_id`.
    async fn write_flagged(&self, record: FlaggedSessionRecord);

    async fn all(&self) -> Vec<FlaggedSessionRecord>;
}

/// In-memory stand-in for the external history store. Writes are upserts
/// keyed by session id, matching the idempotence requirement in spec §4.9.
#[derive(Default)]
pub struct InMemoryDurableWriter {
    records: RwLock<std::collections::HashMap<String, FlaggedSessionRecord>>,
}

impl InMemoryDurableWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DurableWriter for InMemoryDurableWriter {
    async fn write_flagged(&self, record: FlaggedSessionRecord) {
        self.records
            .write()
            .await
            .insert(record.session_id.clone(), record);
    }

    async fn all(&self) -> Vec<FlaggedSessionRecord> {
        self.records.read().await.values().cloned().collect()
    }
}
