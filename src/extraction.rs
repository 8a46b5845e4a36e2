//! Cross-cutting extraction helpers (spec §4.6.1, §4.6.3): tool calls, token
//! usage, TTS requests. All best-effort — malformed JSON is silently
//! ignored (spec §7 "per-request transient scan misses").

use serde_json::Value;

use crate::session::types::ToolCallRecord;

/// Walk a request body for tool *definitions* sent by the client (OpenAI
/// `tools[].function.name` / Anthropic `tools[].name` shapes).
pub fn extract_tool_definitions(body: &[u8]) -> Vec<ToolCallRecord> {
    let Ok(json) = serde_json::from_slice::<Value>(body) else {
        return Vec::new();
    };
    let Some(tools) = json.get("tools").and_then(Value::as_array) else {
        return Vec::new();
    };
    tools
        .iter()
        .filter_map(|t| {
            let name = t
                .get("function")
                .and_then(|f| f.get("name"))
                .or_else(|| t.get("name"))
                .and_then(Value::as_str)?;
            Some(ToolCallRecord {
                id: String::new(),
                name: name.to_string(),
                call_type: "definition".to_string(),
            })
        })
        .collect()
}

/// Walk a response body for tool calls *emitted by the model* (OpenAI
/// `choices[].message.tool_calls[]` / Anthropic `content[].type=="tool_use"`
/// shapes).
pub fn extract_emitted_tool_calls(body: &[u8]) -> Vec<ToolCallRecord> {
    let Ok(json) = serde_json::from_slice::<Value>(body) else {
        return Vec::new();
    };

    let mut out = Vec::new();

    if let Some(choices) = json.get("choices").and_then(Value::as_array) {
        for choice in choices {
            if let Some(calls) = choice
                .pointer("/message/tool_calls")
                .and_then(Value::as_array)
            {
                for call in calls {
                    let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
                    let name = call
                        .pointer("/function/name")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    out.push(ToolCallRecord {
                        id: id.to_string(),
                        name: name.to_string(),
                        call_type: "call".to_string(),
                    });
                }
            }
        }
    }

    if let Some(content) = json.get("content").and_then(Value::as_array) {
        for block in content {
            if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                out.push(ToolCallRecord {
                    id: id.to_string(),
                    name: name.to_string(),
                    call_type: "call".to_string(),
                });
            }
        }
    }

    out
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Parse provider-specific usage fields from a non-streaming response body
/// (OpenAI `usage.prompt_tokens`/`usage.completion_tokens`, Anthropic
/// `usage.input_tokens`/`usage.output_tokens`).
pub fn extract_token_usage(body: &[u8]) -> Option<TokenUsage> {
    let json = serde_json::from_slice::<Value>(body).ok()?;
    let usage = json.get("usage")?;
    if let (Some(p), Some(c)) = (
        usage.get("prompt_tokens").and_then(Value::as_u64),
        usage.get("completion_tokens").and_then(Value::as_u64),
    ) {
        return Some(TokenUsage {
            prompt_tokens: p,
            completion_tokens: c,
        });
    }
    if let (Some(p), Some(c)) = (
        usage.get("input_tokens").and_then(Value::as_u64),
        usage.get("output_tokens").and_then(Value::as_u64),
    ) {
        return Some(TokenUsage {
            prompt_tokens: p,
            completion_tokens: c,
        });
    }
    None
}

#[derive(Debug, Clone)]
pub struct TtsRequest {
    pub model: Option<String>,
    pub voice: Option<String>,
    pub input: Option<String>,
}

/// TTS endpoints are detected by URL-path suffix (spec §4.6.3).
pub fn is_tts_path(path: &str) -> bool {
    path.ends_with("/audio/speech") || path.ends_with("/v1/text-to-speech") || path.ends_with("/tts")
}

pub fn extract_tts_request(body: &[u8]) -> Option<TtsRequest> {
    let json = serde_json::from_slice::<Value>(body).ok()?;
    Some(TtsRequest {
        model: json.get("model").and_then(Value::as_str).map(String::from),
        voice: json.get("voice").and_then(Value::as_str).map(String::from),
        input: json
            .get("input")
            .or_else(|| json.get("text"))
            .and_then(Value::as_str)
            .map(String::from),
    })
}

/// Whitespace-tolerant detection of `"stream":true` in a JSON body, plus the
/// `Accept: text/event-stream` header (spec §4.6 step 9).
pub fn body_requests_stream(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body);
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    compact.contains("\"stream\":true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_stream_flag_with_whitespace_variance() {
        assert!(body_requests_stream(br#"{"model":"x", "stream" : true }"#));
        assert!(body_requests_stream(br#"{"stream":true}"#));
        assert!(!body_requests_stream(br#"{"stream":false}"#));
    }

    #[test]
    fn extracts_openai_style_token_usage() {
        let body = br#"{"usage":{"prompt_tokens":10,"completion_tokens":5}}"#;
        let usage = extract_token_usage(body).unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
    }

    #[test]
    fn malformed_json_yields_no_panic_and_no_usage() {
        assert!(extract_token_usage(b"not json").is_none());
        assert!(extract_tool_definitions(b"not json").is_empty());
    }
}
