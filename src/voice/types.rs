//! Voice session data model (spec §3 "Voice session", §4.8).

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::session::types::KillSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    Inviting,
    Active,
    Held,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    Stt,
    Tts,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub source: TranscriptSource,
    pub is_final: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// 16 kHz / 16-bit mono, uncompressed: 32_000 bytes/sec (spec §4.8 "Audio
/// metrics"). Not authoritative — metrics only.
pub const ASSUMED_AUDIO_BYTES_PER_SEC: f64 = 32_000.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceFrameCounters {
    pub audio_frames_in: u64,
    pub audio_frames_out: u64,
    pub audio_bytes_in: u64,
    pub audio_bytes_out: u64,
    pub text_frames_in: u64,
    pub text_frames_out: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSession {
    pub id: String,
    pub parent_session_id: String,
    pub state: VoiceState,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub answered_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub protocol: String,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub counters: VoiceFrameCounters,
    pub estimated_audio_duration_secs: f64,
    pub turn_count: u64,
    pub transcript: Vec<TranscriptEntry>,
    #[serde(skip)]
    pub term_signal: KillSignal,
}

impl VoiceSession {
    pub fn new(id: String, parent_session_id: String, protocol: String, now: OffsetDateTime) -> Self {
        Self {
            id,
            parent_session_id,
            state: VoiceState::Inviting,
            started_at: now,
            answered_at: None,
            ended_at: None,
            protocol,
            model: None,
            voice: None,
            counters: VoiceFrameCounters::default(),
            estimated_audio_duration_secs: 0.0,
            turn_count: 0,
            transcript: Vec::new(),
            term_signal: KillSignal::new(),
        }
    }

    pub fn record_audio_in(&mut self, bytes: usize) {
        self.counters.audio_frames_in += 1;
        self.counters.audio_bytes_in += bytes as u64;
        self.estimated_audio_duration_secs += bytes as f64 / ASSUMED_AUDIO_BYTES_PER_SEC;
    }

    pub fn record_audio_out(&mut self, bytes: usize) {
        self.counters.audio_frames_out += 1;
        self.counters.audio_bytes_out += bytes as u64;
        self.estimated_audio_duration_secs += bytes as f64 / ASSUMED_AUDIO_BYTES_PER_SEC;
    }

    pub fn push_transcript(&mut self, entry: TranscriptEntry) {
        self.transcript.push(entry);
    }

    pub fn transcript_blob(&self) -> String {
        self.transcript
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
