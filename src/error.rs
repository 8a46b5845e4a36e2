use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced on the request path. Each variant maps onto the status/body
/// contract in spec §6/§7.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("session terminated")]
    SessionTerminated,

    #[error("session killed")]
    SessionKilled,

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("response blocked: {message} (terminated={terminated})")]
    ResponseBlocked { message: String, terminated: bool },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::SessionTerminated => (
                StatusCode::FORBIDDEN,
                axum::Json(json!({
                    "error": "session_terminated",
                    "message": "session has been killed or terminated",
                })),
            )
                .into_response(),
            ProxyError::SessionKilled => (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(json!({
                    "error": "session_terminated",
                    "message": "session kill signal closed during handling",
                })),
            )
                .into_response(),
            ProxyError::PolicyViolation(message) => (
                StatusCode::FORBIDDEN,
                axum::Json(json!({
                    "error": "policy_violation",
                    "message": message,
                })),
            )
                .into_response(),
            ProxyError::ResponseBlocked {
                message,
                terminated,
            } => {
                let mut response = (
                    StatusCode::FORBIDDEN,
                    axum::Json(json!({
                        "error": "response_blocked",
                        "message": message,
                        "session_terminated": terminated,
                    })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert("X-Elida-Blocked", "true".parse().unwrap());
                response
            }
            ProxyError::BackendUnavailable(message) => (
                StatusCode::BAD_GATEWAY,
                axum::Json(json!({ "error": "backend_unavailable", "message": message })),
            )
                .into_response(),
            ProxyError::Json(err) => (
                StatusCode::BAD_REQUEST,
                axum::Json(json!({ "error": "malformed_body", "message": err.to_string() })),
            )
                .into_response(),
            ProxyError::Other(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({ "error": "internal_error", "message": err.to_string() })),
            )
                .into_response(),
        }
    }
}

/// Errors that can occur while a rule set is loaded at startup. Fatal: the
/// process refuses to run with an unparseable preset or pattern.
#[derive(Debug, Error)]
pub enum PolicyLoadError {
    #[error("invalid pattern in rule {rule}: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors returned by `SessionManager` / `SessionStore` operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    /// The id exists but is `terminated`/`timed_out`/`completed` — spec §8
    /// boundary behavior: "A session id supplied by the client but already
    /// `terminated` yields 403, not a new session." Distinct from
    /// `NotFound` so request-path callers can map it to the
    /// `session_terminated` 403 rather than a 500.
    #[error("session {0} is terminated")]
    Terminated(String),

    #[error("session {0} is not killed, cannot resume")]
    NotKilled(String),

    #[error("no default backend configured")]
    NoDefaultBackend,
}
