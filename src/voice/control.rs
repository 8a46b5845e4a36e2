//! Protocol-specific control-frame parsers (spec §4.8 recognizer table).
//! Each recognizer is tried against an inbound or outbound text frame; the
//! first to recognize an INVITE establishes the protocol for the rest of the
//! voice session's lifetime.

use regex::Regex;
use serde_json::Value;

use super::types::{Speaker, TranscriptSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Invite,
    Ok,
    Bye,
    Hold,
    Resume,
    Cancel,
    TurnStart,
    TurnEnd,
}

#[derive(Debug, Clone)]
pub struct TranscriptFragment {
    pub speaker: Speaker,
    pub text: String,
    pub source: TranscriptSource,
    pub is_final: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ControlMessage {
    pub kind_inbound: Option<ControlKind>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub transcript: Option<TranscriptFragment>,
}

impl ControlMessage {
    fn with_kind(kind: ControlKind) -> Self {
        Self {
            kind_inbound: Some(kind),
            ..Default::default()
        }
    }
}

/// Attempt every built-in recognizer plus any operator-supplied regex
/// patterns (spec §4.8: "A user-supplied regex pattern list can add further
/// recognizers"). Returns the protocol name alongside the parsed message.
pub fn recognize(text: &str, extra_invite_patterns: &[Regex]) -> Option<(&'static str, ControlMessage)> {
    if let Some(msg) = parse_openai_realtime(text) {
        return Some(("openai_realtime", msg));
    }
    if let Some(msg) = parse_deepgram(text) {
        return Some(("deepgram", msg));
    }
    if let Some(msg) = parse_elevenlabs(text) {
        return Some(("elevenlabs", msg));
    }
    if let Some(msg) = parse_livekit(text) {
        return Some(("livekit", msg));
    }
    if extra_invite_patterns.iter().any(|p| p.is_match(text)) {
        return Some(("custom", ControlMessage::with_kind(ControlKind::Invite)));
    }
    None
}

/// Parse with a protocol already pinned (spec §4.8: once established, a
/// voice session keeps using its own protocol's parser for the rest of its
/// life rather than re-running every recognizer).
pub fn parse_with_protocol(protocol: &str, text: &str) -> ControlMessage {
    match protocol {
        "openai_realtime" => parse_openai_realtime(text).unwrap_or_default(),
        "deepgram" => parse_deepgram(text).unwrap_or_default(),
        "elevenlabs" => parse_elevenlabs(text).unwrap_or_default(),
        "livekit" => parse_livekit(text).unwrap_or_default(),
        _ => ControlMessage::default(),
    }
}

fn parse_openai_realtime(text: &str) -> Option<ControlMessage> {
    let json: Value = serde_json::from_str(text).ok()?;
    let event_type = json.get("type").and_then(Value::as_str)?;

    if !event_type.starts_with("session.")
        && !event_type.starts_with("response.")
        && !event_type.starts_with("conversation.")
        && event_type != "error"
    {
        return None;
    }

    let mut msg = ControlMessage::default();
    match event_type {
        "session.create" | "session.update" => {
            msg.kind_inbound = Some(ControlKind::Invite);
            msg.model = json.pointer("/session/model").and_then(Value::as_str).map(String::from);
            msg.voice = json.pointer("/session/voice").and_then(Value::as_str).map(String::from);
        }
        "session.created" | "session.updated" => msg.kind_inbound = Some(ControlKind::Ok),
        "error" => msg.kind_inbound = Some(ControlKind::Bye),
        "response.audio_transcript.delta" | "response.audio_transcript.done" => {
            let final_ = event_type.ends_with("done");
            let text = json
                .get("delta")
                .or_else(|| json.get("transcript"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            msg.transcript = Some(TranscriptFragment {
                speaker: Speaker::Assistant,
                text,
                source: TranscriptSource::Stt,
                is_final: final_,
            });
            if final_ {
                msg.kind_inbound = Some(ControlKind::TurnEnd);
            }
        }
        "response.text.delta" | "response.text.done" => {
            let final_ = event_type.ends_with("done");
            let text = json
                .get("delta")
                .or_else(|| json.get("text"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            msg.transcript = Some(TranscriptFragment {
                speaker: Speaker::Assistant,
                text,
                source: TranscriptSource::Text,
                is_final: final_,
            });
        }
        "conversation.item.input_audio_transcription.completed" => {
            let text = json.get("transcript").and_then(Value::as_str).unwrap_or_default().to_string();
            msg.transcript = Some(TranscriptFragment {
                speaker: Speaker::User,
                text,
                source: TranscriptSource::Stt,
                is_final: true,
            });
        }
        "response.created" => msg.kind_inbound = Some(ControlKind::TurnStart),
        _ => {}
    }
    Some(msg)
}

fn parse_deepgram(text: &str) -> Option<ControlMessage> {
    let json: Value = serde_json::from_str(text).ok()?;
    let kind = json.get("type").and_then(Value::as_str)?;
    let mut msg = ControlMessage::default();
    match kind {
        "Metadata" => msg.kind_inbound = Some(ControlKind::Ok),
        "Results" => {
            let alt = json.pointer("/channel/alternatives/0")?;
            let transcript = alt.get("transcript").and_then(Value::as_str).unwrap_or_default();
            if transcript.is_empty() {
                return None;
            }
            let is_final = json.get("is_final").and_then(Value::as_bool).unwrap_or(false);
            msg.transcript = Some(TranscriptFragment {
                speaker: Speaker::User,
                text: transcript.to_string(),
                source: TranscriptSource::Stt,
                is_final,
            });
            if is_final {
                msg.kind_inbound = Some(ControlKind::TurnEnd);
            }
        }
        _ => return None,
    }
    Some(msg)
}

fn parse_elevenlabs(text: &str) -> Option<ControlMessage> {
    let json: Value = serde_json::from_str(text).ok()?;
    let mut msg = ControlMessage::default();
    if json.get("voice_settings").is_some() {
        msg.kind_inbound = Some(ControlKind::Invite);
        msg.voice = json
            .get("voice_id")
            .or_else(|| json.get("voice"))
            .and_then(Value::as_str)
            .map(String::from);
        return Some(msg);
    }
    if json.get("flush").and_then(Value::as_bool) == Some(true)
        || json.get("isFinal").and_then(Value::as_bool) == Some(true)
    {
        msg.kind_inbound = Some(ControlKind::Bye);
        return Some(msg);
    }
    if let Some(t) = json.get("text").and_then(Value::as_str) {
        if !t.is_empty() {
            msg.transcript = Some(TranscriptFragment {
                speaker: Speaker::Assistant,
                text: t.to_string(),
                source: TranscriptSource::Tts,
                is_final: json.get("isFinal").and_then(Value::as_bool).unwrap_or(false),
            });
            return Some(msg);
        }
    }
    None
}

fn parse_livekit(text: &str) -> Option<ControlMessage> {
    let json: Value = serde_json::from_str(text).ok()?;
    let kind = json.get("type").or_else(|| json.get("event")).and_then(Value::as_str)?;
    let mut msg = ControlMessage::default();
    match kind {
        "participant_joined" | "room_joined" => msg.kind_inbound = Some(ControlKind::Invite),
        "participant_left" | "disconnected" => msg.kind_inbound = Some(ControlKind::Bye),
        _ => return None,
    }
    Some(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_openai_realtime_invite() {
        let text = r#"{"type":"session.create","session":{"model":"gpt-4o-realtime","voice":"alloy"}}"#;
        let (protocol, msg) = recognize(text, &[]).unwrap();
        assert_eq!(protocol, "openai_realtime");
        assert_eq!(msg.kind_inbound, Some(ControlKind::Invite));
        assert_eq!(msg.model.as_deref(), Some("gpt-4o-realtime"));
    }

    #[test]
    fn recognizes_deepgram_final_transcript() {
        let text = r#"{"type":"Results","is_final":true,"channel":{"alternatives":[{"transcript":"hello there"}]}}"#;
        let (protocol, msg) = recognize(text, &[]).unwrap();
        assert_eq!(protocol, "deepgram");
        let frag = msg.transcript.unwrap();
        assert_eq!(frag.text, "hello there");
        assert!(frag.is_final);
    }

    #[test]
    fn recognizes_elevenlabs_invite_by_voice_settings() {
        let text = r#"{"voice_settings":{"stability":0.5},"voice_id":"rachel"}"#;
        let (protocol, msg) = recognize(text, &[]).unwrap();
        assert_eq!(protocol, "elevenlabs");
        assert_eq!(msg.kind_inbound, Some(ControlKind::Invite));
    }

    #[test]
    fn unrecognized_text_yields_none() {
        assert!(recognize("not a control frame", &[]).is_none());
    }
}
