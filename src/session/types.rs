//! Core session data model (spec §3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::broadcast;

/// Bound on the recent-request timestamp window used by rate-limit rules.
pub const RECENT_REQUEST_WINDOW: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Killed,
    Terminated,
    TimedOut,
    Completed,
}

/// A one-shot broadcast primitive: closed exactly once, observable by any
/// number of concurrent tasks. Mirrors the `tokio::sync::broadcast`-over-unit
/// idiom used for connection teardown in `querymt-agent::ui::connection`.
#[derive(Debug, Clone)]
pub struct KillSignal {
    tx: broadcast::Sender<()>,
    closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl KillSignal {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        Self {
            tx,
            closed: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Close the signal. Idempotent: a second call is a no-op, preserving the
    /// "closed exactly once" invariant from spec §3.
    pub fn close(&self) {
        if !self.closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            let _ = self.tx.send(());
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Await closure. Returns immediately if already closed.
    pub async fn wait(&self) {
        if self.is_closed() {
            return;
        }
        let mut rx = self.subscribe();
        let _ = rx.recv().await;
    }
}

impl Default for KillSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionCounters {
    pub request_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub backends_used: HashMap<String, u64>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub is_websocket: bool,
    pub ws_frames_in: u64,
    pub ws_frames_out: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub call_type: String,
}

/// Bounded ring of recent request timestamps (spec §3: N = 128, wraparound
/// in-place).
#[derive(Debug, Clone)]
pub struct RecentRequestWindow {
    buf: Vec<OffsetDateTime>,
    next: usize,
    len: usize,
}

impl RecentRequestWindow {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(RECENT_REQUEST_WINDOW),
            next: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, at: OffsetDateTime) {
        if self.buf.len() < RECENT_REQUEST_WINDOW {
            self.buf.push(at);
        } else {
            self.buf[self.next] = at;
        }
        self.next = (self.next + 1) % RECENT_REQUEST_WINDOW;
        self.len = self.buf.len();
    }

    /// Count of timestamps strictly newer than `since`.
    pub fn count_since(&self, since: OffsetDateTime) -> usize {
        self.buf.iter().filter(|t| **t >= since).count()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for RecentRequestWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// A recorded policy violation (spec §3 "Session violation set").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub rule_name: String,
    pub severity: crate::policy::rules::Severity,
    pub matched_text: String,
    pub action: crate::policy::rules::RuleAction,
    pub at: OffsetDateTime,
}

/// A captured request/response pair (spec §3 "Captured request pair").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedPair {
    pub method: String,
    pub path: String,
    pub request_body: String,
    pub response_body: String,
    pub status: Option<u16>,
    pub at: OffsetDateTime,
}

pub const TRUNCATION_SUFFIX: &str = "...[truncated]";

/// Truncate `body` to `max_len` bytes, appending the standard suffix when
/// truncation occurred (spec §3, shared by C4 and C5 capture paths).
pub fn truncate_body(body: &str, max_len: usize) -> String {
    if body.len() <= max_len {
        return body.to_string();
    }
    let mut boundary = max_len;
    while boundary > 0 && !body.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}{}", &body[..boundary], TRUNCATION_SUFFIX)
}

/// A traffic group from one client (or explicit identifier) to one backend
/// (spec §3 "Session").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub backend: String,
    pub client_addr: String,
    pub state: SessionState,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub counters: SessionCounters,
    #[serde(skip)]
    pub recent_requests: RecentRequestWindow,
    #[serde(skip)]
    pub kill_signal: KillSignal,
    pub flagged: bool,
    pub violations: Vec<Violation>,
    pub captures: Vec<CapturedPair>,
    pub metadata: Option<HashMap<String, String>>,
}

impl Session {
    pub fn new(id: String, backend: String, client_addr: String, now: OffsetDateTime) -> Self {
        Self {
            id,
            backend,
            client_addr,
            state: SessionState::Active,
            started_at: now,
            last_activity_at: now,
            ended_at: None,
            counters: SessionCounters::default(),
            recent_requests: RecentRequestWindow::new(),
            kill_signal: KillSignal::new(),
            flagged: false,
            violations: Vec::new(),
            captures: Vec::new(),
            metadata: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active)
    }

    pub fn record_request(&mut self, now: OffsetDateTime, bytes_in: u64) {
        self.last_activity_at = now;
        self.counters.request_count += 1;
        self.counters.bytes_in += bytes_in;
        *self
            .counters
            .backends_used
            .entry(self.backend.clone())
            .or_insert(0) += 1;
        self.recent_requests.push(now);
    }

    pub fn record_violation(&mut self, v: Violation) {
        self.flagged = true;
        self.violations.push(v);
    }
}
