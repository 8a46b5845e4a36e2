//! Per-client blocklist (spec §3 "Blocklist entry", §4.2 block-mode table).

use std::collections::HashMap;
use time::ext::NumericalDuration;
use time::OffsetDateTime;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockMode {
    #[default]
    Duration,
    UntilHourChange,
    Permanent,
}

#[derive(Debug, Clone)]
struct BlockEntry {
    expires_at: OffsetDateTime,
}

/// Keyed by the full session identity (spec §8 scenario 5 reading — see
/// `SessionManager::blocklist_key`'s doc comment for why this is keyed
/// per-(client, backend) rather than per-client-hash alone).
#[derive(Default)]
pub struct Blocklist {
    entries: RwLock<HashMap<String, BlockEntry>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, client_key: String, mode: BlockMode, kill_time: OffsetDateTime) {
        let expires_at = expiry_for(mode, kill_time);
        self.entries
            .write()
            .await
            .insert(client_key, BlockEntry { expires_at });
    }

    pub async fn remove(&self, client_key: &str) {
        self.entries.write().await.remove(client_key);
    }

    /// True if `client_key` has an unexpired entry as of `now`.
    pub async fn is_blocked(&self, client_key: &str, now: OffsetDateTime) -> bool {
        match self.entries.read().await.get(client_key) {
            Some(entry) => now < entry.expires_at,
            None => false,
        }
    }
}

fn expiry_for(mode: BlockMode, kill_time: OffsetDateTime) -> OffsetDateTime {
    match mode {
        BlockMode::Duration => kill_time + default_block_duration(),
        BlockMode::UntilHourChange => next_hour_boundary(kill_time),
        BlockMode::Permanent => time::macros::datetime!(9999-12-31 23:59:59 UTC),
    }
}

fn default_block_duration() -> time::Duration {
    1.hours()
}

fn next_hour_boundary(now: OffsetDateTime) -> OffsetDateTime {
    let truncated_to_hour = now
        .replace_minute(0)
        .and_then(|t| t.replace_second(0))
        .and_then(|t| t.replace_nanosecond(0))
        .unwrap_or(now);
    truncated_to_hour + 1.hours()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duration_mode_expires_after_configured_window() {
        let list = Blocklist::new();
        let now = OffsetDateTime::now_utc();
        list.insert("client-abc".to_string(), BlockMode::Duration, now)
            .await;
        assert!(list.is_blocked("client-abc", now).await);
        assert!(!list.is_blocked("client-abc", now + 2.hours()).await);
    }

    #[tokio::test]
    async fn until_hour_change_expires_at_next_hour_boundary() {
        let list = Blocklist::new();
        let kill_time = time::macros::datetime!(2026-07-31 10:15:00 UTC);
        list.insert(
            "client-xyz".to_string(),
            BlockMode::UntilHourChange,
            kill_time,
        )
        .await;
        assert!(list.is_blocked("client-xyz", kill_time).await);
        assert!(
            list.is_blocked(
                "client-xyz",
                time::macros::datetime!(2026-07-31 10:59:59 UTC)
            )
            .await
        );
        assert!(
            !list
                .is_blocked(
                    "client-xyz",
                    time::macros::datetime!(2026-07-31 11:00:01 UTC)
                )
                .await
        );
    }

    #[tokio::test]
    async fn permanent_mode_never_expires() {
        let list = Blocklist::new();
        let now = OffsetDateTime::now_utc();
        list.insert("client-p".to_string(), BlockMode::Permanent, now)
            .await;
        assert!(list.is_blocked("client-p", now + 10000.days()).await);
    }

    #[tokio::test]
    async fn resume_removes_entry() {
        let list = Blocklist::new();
        let now = OffsetDateTime::now_utc();
        list.insert("client-r".to_string(), BlockMode::Permanent, now)
            .await;
        list.remove("client-r").await;
        assert!(!list.is_blocked("client-r", now).await);
    }
}
