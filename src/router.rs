//! Backend router (C3, spec §4.3): select a backend by header, model
//! pattern, path prefix, or default. Connection pools are per-backend so a
//! slow/failing backend cannot exhaust another's pool (spec §4.3).

use glob::Pattern;
use serde_json::Value;
use std::time::Duration;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    OpenAi,
    Anthropic,
    Generic,
}

#[derive(Clone)]
pub struct Backend {
    pub name: String,
    pub base_url: String,
    pub backend_type: BackendType,
    pub model_patterns: Vec<Pattern>,
    pub is_default: bool,
    /// Per-backend connection pool (spec §4.3). `reqwest::Client` already
    /// holds its own pool of reusable connections; one client per backend
    /// keeps pools isolated, matching the teacher's one-`Client`-per-caller
    /// posture in `querymt-service`.
    pub client: reqwest::Client,
}

impl Backend {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        backend_type: BackendType,
        model_globs: &[&str],
        is_default: bool,
    ) -> Self {
        let model_patterns = model_globs
            .iter()
            .filter_map(|g| Pattern::new(g).ok())
            .collect();
        Self {
            name: name.into(),
            base_url: base_url.into(),
            backend_type,
            model_patterns,
            is_default,
            client: reqwest::Client::builder()
                .pool_idle_timeout(Duration::from_secs(90))
                .build()
                .expect("reqwest client"),
        }
    }

    fn matches_model(&self, model: &str) -> bool {
        self.model_patterns.iter().any(|p| p.matches(model))
    }
}

/// Evaluated in order: header, model, path, default (spec §4.3). The first
/// non-none selection wins; `default` always resolves.
pub struct BackendRouter {
    backends: Vec<Backend>,
    default_idx: usize,
    header_name: String,
}

impl BackendRouter {
    pub fn new(backends: Vec<Backend>, header_name: impl Into<String>) -> Result<Self, SessionError> {
        let defaults: Vec<usize> = backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_default)
            .map(|(i, _)| i)
            .collect();
        if defaults.len() != 1 {
            return Err(SessionError::NoDefaultBackend);
        }
        Ok(Self {
            backends,
            default_idx: defaults[0],
            header_name: header_name.into(),
        })
    }

    pub fn default_backend(&self) -> &Backend {
        &self.backends[self.default_idx]
    }

    pub fn find(&self, name: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| b.name == name)
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// spec §4.3: header → model → path → default, first non-none wins.
    pub fn select(
        &self,
        header_value: Option<&str>,
        body: Option<&[u8]>,
        path: &str,
    ) -> &Backend {
        if let Some(name) = header_value {
            if let Some(b) = self.find(name) {
                return b;
            }
            tracing::warn!(backend = %name, "unknown backend named in header, falling through");
        }

        if let Some(body) = body {
            if let Ok(json) = serde_json::from_slice::<Value>(body) {
                if let Some(model) = json.get("model").and_then(Value::as_str) {
                    if let Some(b) = self.backends.iter().find(|b| b.matches_model(model)) {
                        return b;
                    }
                }
            }
        }

        let trimmed = path.trim_start_matches('/');
        if let Some(segment) = trimmed.split('/').next() {
            if let Some(b) = self.backends.iter().find(|b| {
                b.name == segment
                    || format!("{:?}", b.backend_type).to_lowercase() == segment.to_lowercase()
            }) {
                return b;
            }
        }

        self.default_backend()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> BackendRouter {
        let backends = vec![
            Backend::new(
                "openai",
                "https://api.openai.example",
                BackendType::OpenAi,
                &["gpt-*"],
                false,
            ),
            Backend::new(
                "anthropic",
                "https://api.anthropic.example",
                BackendType::Anthropic,
                &["claude-*"],
                true,
            ),
        ];
        BackendRouter::new(backends, "X-Elida-Backend").unwrap()
    }

    #[test]
    fn selects_by_model_glob() {
        let r = router();
        let body = br#"{"model":"gpt-4"}"#;
        assert_eq!(r.select(None, Some(body), "/v1/chat/completions").name, "openai");
        let body2 = br#"{"model":"claude-3-5-sonnet"}"#;
        assert_eq!(
            r.select(None, Some(body2), "/v1/chat/completions").name,
            "anthropic"
        );
    }

    #[test]
    fn falls_back_to_default() {
        let r = router();
        assert_eq!(r.select(None, None, "/unknown").name, "anthropic");
    }

    #[test]
    fn is_deterministic_given_same_inputs() {
        let r = router();
        let body = br#"{"model":"gpt-4"}"#;
        let a = r.select(None, Some(body), "/v1/chat/completions").name.clone();
        let b = r.select(None, Some(body), "/v1/chat/completions").name.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_zero_or_two_defaults() {
        let zero = vec![Backend::new(
            "openai",
            "https://x",
            BackendType::OpenAi,
            &[],
            false,
        )];
        assert!(BackendRouter::new(zero, "X-Elida-Backend").is_err());

        let two = vec![
            Backend::new("a", "https://a", BackendType::Generic, &[], true),
            Backend::new("b", "https://b", BackendType::Generic, &[], true),
        ];
        assert!(BackendRouter::new(two, "X-Elida-Backend").is_err());
    }
}
