//! Voice session manager (C8, spec §4.8): a second, nested lifecycle
//! multiplexed over a single WebSocket.
//!
//! A WebSocket speaks exactly one voice protocol for its lifetime in
//! practice, so the manager pins the protocol on the first recognized
//! INVITE and parses every subsequent frame with that protocol's parser
//! rather than re-running all four recognizers per frame.

pub mod control;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::session::store::SessionHandle;
use crate::state::AppState;
use control::{parse_with_protocol, recognize, ControlKind};
use types::{TranscriptEntry, VoiceSession, VoiceState};

#[derive(Clone)]
pub struct VoiceConfig {
    pub enabled: bool,
    pub max_concurrent: usize,
    pub auto_start_on_binary_frame: bool,
    pub extra_invite_patterns: Vec<Regex>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent: 4,
            auto_start_on_binary_frame: true,
            extra_invite_patterns: Vec::new(),
        }
    }
}

/// Owns every voice session multiplexed over one WebSocket (spec §4.8: "at
/// most one voice manager exists" per WebSocket).
pub struct VoiceManager {
    parent_session_id: String,
    config: VoiceConfig,
    state: Arc<AppState>,
    parent: SessionHandle,
    protocol: RwLock<Option<String>>,
    active: RwLock<HashMap<String, Arc<RwLock<VoiceSession>>>>,
    history: RwLock<Vec<VoiceSession>>,
}

impl VoiceManager {
    /// `state`/`parent` give the manager everything it needs to act on a
    /// voice session the moment it ends (spec §4.9: the durable writer fires
    /// "on voice-session end", not batched until the WebSocket closes).
    pub fn new(parent_session_id: String, config: VoiceConfig, state: Arc<AppState>, parent: SessionHandle) -> Self {
        Self {
            parent_session_id,
            config,
            state,
            parent,
            protocol: RwLock::new(None),
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    async fn start_session(&self, protocol: &str) -> Option<Arc<RwLock<VoiceSession>>> {
        if self.active.read().await.len() >= self.config.max_concurrent {
            tracing::warn!(parent = %self.parent_session_id, "voice session limit reached, dropping invite");
            return None;
        }
        let id = Uuid::new_v4().to_string();
        let session = VoiceSession::new(
            id.clone(),
            self.parent_session_id.clone(),
            protocol.to_string(),
            OffsetDateTime::now_utc(),
        );
        let handle = Arc::new(RwLock::new(session));
        self.active.write().await.insert(id, handle.clone());
        Some(handle)
    }

    /// The most recently started still-active session. Generic protocols
    /// carry no per-frame session identifier, so every control/transcript
    /// frame is attributed to whichever voice session is currently open.
    async fn current_session(&self) -> Option<Arc<RwLock<VoiceSession>>> {
        self.active.read().await.values().next().cloned()
    }

    /// Handle a text frame in either direction (spec §4.8 lifecycle table).
    pub async fn on_text_frame(&self, text: &str, outbound: bool) {
        if !self.config.enabled {
            return;
        }

        let pinned = self.protocol.read().await.clone();
        let (protocol, ctrl) = match pinned {
            Some(proto) => (proto.clone(), parse_with_protocol(&proto, text)),
            None => match recognize(text, &self.config.extra_invite_patterns) {
                Some((p, m)) => {
                    *self.protocol.write().await = Some(p.to_string());
                    (p.to_string(), m)
                }
                None => return,
            },
        };

        let handle = if ctrl.kind_inbound == Some(ControlKind::Invite) {
            match self.current_session().await {
                Some(h) => h,
                None => match self.start_session(&protocol).await {
                    Some(h) => h,
                    None => return,
                },
            }
        } else {
            match self.current_session().await {
                Some(h) => h,
                None => return,
            }
        };

        let mut session = handle.write().await;
        if let Some(model) = ctrl.model {
            session.model = Some(model);
        }
        if let Some(voice) = ctrl.voice {
            session.voice = Some(voice);
        }

        match ctrl.kind_inbound {
            Some(ControlKind::Invite) => session.state = VoiceState::Inviting,
            Some(ControlKind::Ok) => {
                session.state = VoiceState::Active;
                session.answered_at = Some(OffsetDateTime::now_utc());
            }
            Some(ControlKind::Hold) => session.state = VoiceState::Held,
            Some(ControlKind::Resume) => session.state = VoiceState::Active,
            Some(ControlKind::TurnStart) => session.turn_count += 1,
            Some(ControlKind::Bye) | Some(ControlKind::Cancel) => {
                session.state = VoiceState::Terminating;
            }
            _ => {}
        }

        if let Some(frag) = ctrl.transcript {
            session.push_transcript(TranscriptEntry {
                speaker: frag.speaker,
                text: frag.text,
                source: frag.source,
                is_final: frag.is_final,
                at: OffsetDateTime::now_utc(),
            });
        }

        if outbound {
            session.counters.text_frames_out += 1;
        } else {
            session.counters.text_frames_in += 1;
        }

        let should_terminate = matches!(session.state, VoiceState::Terminating);
        drop(session);
        if should_terminate {
            self.terminate_session(&handle, "bye").await;
        }
    }

    /// Auto-start a voice session on the first inbound binary frame when no
    /// protocol has been recognized from text yet (spec §4.7).
    pub async fn on_binary_frame(&self, bytes: &[u8], outbound: bool) {
        if !self.config.enabled {
            return;
        }
        if self.active.read().await.is_empty() && !outbound && self.config.auto_start_on_binary_frame {
            self.start_session("generic_audio").await;
        }
        if let Some(handle) = self.current_session().await {
            let mut session = handle.write().await;
            if outbound {
                session.record_audio_out(bytes.len());
            } else {
                session.record_audio_in(bytes.len());
            }
        }
    }

    async fn terminate_session(&self, handle: &Arc<RwLock<VoiceSession>>, _reason: &str) {
        let mut session = handle.write().await;
        session.state = VoiceState::Terminated;
        session.ended_at = Some(OffsetDateTime::now_utc());
        session.term_signal.close();
        let id = session.id.clone();
        let frozen = session.clone();
        drop(session);
        self.active.write().await.remove(&id);
        self.history.write().await.push(frozen.clone());
        self.scan_and_persist(&frozen).await;
    }

    /// WebSocket close or policy terminate: synthesize BYE for every session
    /// still active (spec §4.7 "Shutdown").
    pub async fn terminate_all(&self, _reason: &str) {
        let handles: Vec<_> = self.active.read().await.values().cloned().collect();
        for handle in handles {
            self.terminate_session(&handle, "synthetic_bye").await;
        }
    }

    /// CDR scan for one ended voice session (spec §4.8/§4.9): run its
    /// transcript through the policy engine as a single blob, record any
    /// violations against the parent session, and persist immediately if
    /// that flagged it — "on voice-session end", not deferred to WebSocket
    /// teardown, so an earlier call in a multi-call WebSocket survives a
    /// crash that happens before the connection itself closes.
    async fn scan_and_persist(&self, voice: &VoiceSession) {
        if voice.transcript.is_empty() {
            return;
        }
        let Some(policy) = &self.state.policy else {
            return;
        };
        let blob = voice.transcript_blob();
        let result = {
            let mut parent_session = self.parent.write().await;
            policy.evaluate_response_content(&mut parent_session, &blob)
        };
        if result.has_violations() {
            tracing::info!(
                voice_session = %voice.id,
                violations = result.violations.len(),
                "voice session CDR scan recorded violations"
            );
        }
        self.state.sessions.write_if_flagged(&self.parent_session_id).await;
    }

    pub async fn history(&self) -> Vec<VoiceSession> {
        self.history.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureMode;
    use crate::durable::{DurableWriter, InMemoryDurableWriter};
    use crate::policy::presets::Preset;
    use crate::policy::{PolicyEngine, PolicyMode, StreamScanMode};
    use crate::router::{Backend, BackendRouter, BackendType};
    use crate::session::blocklist::BlockMode;
    use crate::session::store::InMemorySessionStore;
    use crate::session::SessionManager;

    fn test_state() -> (Arc<AppState>, Arc<InMemoryDurableWriter>) {
        let backend = Backend::new("openai", "https://api.openai.com", BackendType::OpenAi, &["*"], true);
        let router = BackendRouter::new(vec![backend], "X-Elida-Backend").unwrap();
        let durable = InMemoryDurableWriter::new();
        let sessions = Arc::new(SessionManager::new(
            InMemorySessionStore::new(),
            durable.clone(),
            BlockMode::Duration,
            1800,
        ));
        let policy = PolicyEngine::from_preset(Preset::Standard, PolicyMode::Enforce, StreamScanMode::Chunked, Vec::new()).unwrap();
        let state = Arc::new(AppState {
            router,
            sessions,
            policy: Some(policy),
            capture: None,
            capture_mode: CaptureMode::FlaggedOnly,
            session_header: "X-Session-Id".to_string(),
            voice: VoiceConfig {
                enabled: true,
                ..VoiceConfig::default()
            },
        });
        (state, durable)
    }

    /// spec §4.9: the durable write fires "on voice-session end", not
    /// batched until the WebSocket itself closes — a flagged voice call
    /// must be durable before a second voice call even starts on the same
    /// connection.
    #[tokio::test]
    async fn durable_write_happens_on_voice_session_end_not_websocket_close() {
        let (state, durable) = test_state();
        let parent = state
            .sessions
            .get_or_create("parent-1", "openai", "1.2.3.4:1")
            .await
            .unwrap()
            .unwrap();
        let voice = VoiceManager::new("parent-1".to_string(), state.voice.clone(), state.clone(), parent.clone());

        voice
            .on_text_frame(r#"{"voice_settings":{"stability":0.5},"voice_id":"rachel"}"#, false)
            .await;
        voice
            .on_text_frame(r#"{"text":"your ssn is 123-45-6789"}"#, true)
            .await;
        voice.on_text_frame(r#"{"flush":true}"#, true).await;

        // Voice session ended via BYE above; nothing about the parent
        // WebSocket has closed yet.
        let records = durable.all().await;
        assert_eq!(records.len(), 1);
        assert!(!records[0].violations.is_empty());
    }
}
