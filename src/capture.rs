//! Capture buffer (C5, spec §4.5): a per-session ring of recent
//! request/response pairs, independent of the policy engine's capture path.
//! Active only when capture mode is `all`.

use std::collections::{HashMap, VecDeque};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::session::types::{truncate_body, CapturedPair};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    #[default]
    FlaggedOnly,
    All,
}

pub struct RequestFields {
    pub method: String,
    pub path: String,
    pub body: String,
}

pub struct CaptureBuffer {
    max_pairs: usize,
    max_body_size: usize,
    rings: RwLock<HashMap<String, VecDeque<CapturedPair>>>,
}

impl CaptureBuffer {
    pub fn new(max_pairs: usize, max_body_size: usize) -> Self {
        Self {
            max_pairs,
            max_body_size,
            rings: RwLock::new(HashMap::new()),
        }
    }

    /// Append a new pair with an empty response. Silently dropped when the
    /// ring is already full (spec §4.5, documented/testable behavior).
    pub async fn capture(&self, session_id: &str, fields: RequestFields) {
        let mut rings = self.rings.write().await;
        let ring = rings.entry(session_id.to_string()).or_default();
        if ring.len() >= self.max_pairs {
            return;
        }
        ring.push_back(CapturedPair {
            method: fields.method,
            path: fields.path,
            request_body: truncate_body(&fields.body, self.max_body_size),
            response_body: String::new(),
            status: None,
            at: OffsetDateTime::now_utc(),
        });
    }

    pub async fn update_last_response(&self, session_id: &str, body: &str, status: u16) {
        let mut rings = self.rings.write().await;
        if let Some(ring) = rings.get_mut(session_id) {
            if let Some(last) = ring.back_mut() {
                last.response_body = truncate_body(body, self.max_body_size);
                last.status = Some(status);
            }
        }
    }

    pub async fn take(&self, session_id: &str) -> Vec<CapturedPair> {
        self.rings
            .write()
            .await
            .remove(session_id)
            .map(Vec::from)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_drops_new_entries_once_full() {
        let buf = CaptureBuffer::new(2, 100);
        for i in 0..3 {
            buf.capture(
                "s1",
                RequestFields {
                    method: "POST".into(),
                    path: format!("/v1/{i}"),
                    body: "x".into(),
                },
            )
            .await;
        }
        let pairs = buf.take("s1").await;
        assert_eq!(pairs.len(), 2);
    }

    #[tokio::test]
    async fn bodies_are_truncated_with_suffix() {
        let buf = CaptureBuffer::new(1, 4);
        buf.capture(
            "s1",
            RequestFields {
                method: "POST".into(),
                path: "/v1".into(),
                body: "abcdefgh".into(),
            },
        )
        .await;
        let pairs = buf.take("s1").await;
        assert!(pairs[0].request_body.ends_with("...[truncated]"));
    }
}
