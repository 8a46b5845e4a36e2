//! HTTP proxy (C6, spec §4.6): request fixup, policy evaluation, standard
//! and streaming forwarding, response scanning, cross-cutting extraction.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::capture::RequestFields;
use crate::error::ProxyError;
use crate::extraction;
use crate::policy::rules::SessionMetrics;
use crate::session::store::SessionHandle;
use crate::state::AppState;

/// Hop-by-hop headers are never forwarded in either direction (spec §6
/// "all client headers are forwarded except hop-by-hop").
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const STREAM_TERMINATED_MARKER: &str =
    "\n\n[ELIDA: Stream terminated - security policy violation detected]\n";

pub async fn handle(state: Arc<AppState>, addr: SocketAddr, req: Request) -> Response {
    match handle_inner(&state, addr, req).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

async fn handle_inner(state: &Arc<AppState>, addr: SocketAddr, req: Request) -> Result<Response, ProxyError> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let headers = req.headers().clone();

    // Step 2: buffer the request body so routing, policy, and forwarding all
    // see the same bytes.
    let body_bytes = axum::body::to_bytes(req.into_body(), 32 * 1024 * 1024)
        .await
        .map_err(|e| ProxyError::Other(anyhow::anyhow!("reading request body: {e}")))?;

    // Step 3: select a backend.
    let header_backend = headers
        .get(state.router.header_name())
        .and_then(|v| v.to_str().ok());
    let backend = state
        .router
        .select(header_backend, Some(&body_bytes), &path)
        .clone();

    // Step 4: resolve a session.
    let session_id_header = headers
        .get(&state.session_header)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let client_addr = addr.to_string();

    let resolved = match &session_id_header {
        Some(id) => state.sessions.get_or_create(id, &backend.name, &client_addr).await,
        None => {
            state
                .sessions
                .get_or_create_by_client(&client_addr, &backend.name)
                .await
        }
    };

    // A terminated/timed-out/completed id is a 403, not a 500 (spec §8
    // boundary behavior); any other session-store error is unexpected.
    let handle = match resolved {
        Ok(Some(h)) => h,
        Ok(None) => return Err(ProxyError::SessionTerminated),
        Err(crate::error::SessionError::Terminated(_)) => return Err(ProxyError::SessionTerminated),
        Err(e) => return Err(ProxyError::Other(e.into())),
    };

    let session_id = { handle.read().await.id.clone() };
    if handle.read().await.kill_signal.is_closed() {
        return Err(ProxyError::SessionKilled);
    }

    // Step 5: increment counters.
    {
        let mut session = handle.write().await;
        session.record_request(OffsetDateTime::now_utc(), body_bytes.len() as u64);
    }

    // Step 6: request-content policy evaluation.
    if let Some(policy) = &state.policy {
        let body_text = String::from_utf8_lossy(&body_bytes).into_owned();
        let result = {
            let mut session = handle.write().await;
            policy.evaluate_request_content(&mut session, &body_text)
        };
        if result.should_terminate {
            let _ = state.sessions.terminate(&session_id).await;
            state.sessions.write_if_flagged(&session_id).await;
            return Err(ProxyError::PolicyViolation(
                "Request violates security policy".to_string(),
            ));
        }
        if result.should_block {
            state.sessions.write_if_flagged(&session_id).await;
            return Err(ProxyError::PolicyViolation(
                "Request violates security policy".to_string(),
            ));
        }
        if result.has_violations() {
            state.sessions.write_if_flagged(&session_id).await;
        }
    }

    // Step 7: tool-call definition extraction.
    let defs = extraction::extract_tool_definitions(&body_bytes);
    if !defs.is_empty() {
        let mut session = handle.write().await;
        session.counters.tool_calls.extend(defs);
    }

    // Step 8: capture-all enqueue.
    if matches!(state.capture_mode, crate::capture::CaptureMode::All) {
        if let Some(capture) = &state.capture {
            capture
                .capture(
                    &session_id,
                    RequestFields {
                        method: method.to_string(),
                        path: path.clone(),
                        body: String::from_utf8_lossy(&body_bytes).into_owned(),
                    },
                )
                .await;
        }
    }

    // TTS request fields are carried from the request body (not the
    // response, which for TTS endpoints is raw audio) down to bookkeeping.
    let tts_request = extraction::is_tts_path(&path)
        .then(|| extraction::extract_tts_request(&body_bytes))
        .flatten();

    // Step 9: streaming decision.
    let wants_stream = extraction::body_requests_stream(&body_bytes)
        || headers
            .get(axum::http::header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/event-stream"))
            .unwrap_or(false);

    // Step 10: forward.
    let target_url = format!("{}{}", backend.base_url.trim_end_matches('/'), uri.path_and_query().map(|p| p.as_str()).unwrap_or(""));
    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut out_req = backend
        .client
        .request(reqwest_method, &target_url)
        .body(body_bytes.to_vec());
    out_req = apply_forward_headers(out_req, &headers, &backend.base_url);

    let upstream = out_req
        .timeout(Duration::from_secs(300))
        .send()
        .await
        .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;

    // Step 11/12/13.
    handle_response(state, &handle, &session_id, wants_stream, tts_request, upstream).await
}

fn echo_session_header(headers: &mut HeaderMap, header_name: &str, session_id: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(header_name.as_bytes()),
        HeaderValue::from_str(session_id),
    ) {
        headers.insert(name, value);
    }
}

fn apply_forward_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &HeaderMap,
    _backend_base_url: &str,
) -> reqwest::RequestBuilder {
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) || lower == "host" || lower == "content-length" {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(n, v);
        }
    }
    builder
}

/// Grouped response-path context threaded through the three forwarding
/// strategies, to keep their signatures within a sane argument count.
struct ResponseCtx<'a> {
    state: &'a Arc<AppState>,
    handle: &'a SessionHandle,
    session_id: &'a str,
    status: StatusCode,
    resp_headers: HeaderMap,
    tts_request: Option<extraction::TtsRequest>,
}

async fn handle_response(
    state: &Arc<AppState>,
    handle: &SessionHandle,
    session_id: &str,
    wants_stream: bool,
    tts_request: Option<extraction::TtsRequest>,
    upstream: reqwest::Response,
) -> Result<Response, ProxyError> {
    let status = upstream.status();
    let mut resp_headers = HeaderMap::new();
    for (name, value) in upstream.headers().iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            resp_headers.insert(n, v);
        }
    }

    let has_blocking_response_rules = state
        .policy
        .as_ref()
        .map(|p| p.response_has_blocking_rule())
        .unwrap_or(false);

    let ctx = ResponseCtx {
        state,
        handle,
        session_id,
        status,
        resp_headers,
        tts_request,
    };
    let body = if !wants_stream {
        // Standard non-streaming path: buffer, scan (if enabled), forward or
        // block.
        buffered_response(ctx, upstream).await?
    } else if !has_blocking_response_rules {
        // Streaming, no blocking response rules: forward immediately, scan
        // asynchronously afterward for flag-only bookkeeping.
        streamed_async_scan_response(ctx, upstream)
    } else if matches!(
        state.policy.as_ref().map(|p| p.stream_scan_mode),
        Some(crate::policy::StreamScanMode::Buffered)
    ) {
        buffered_response(ctx, upstream).await?
    } else {
        streamed_chunked_scan_response(ctx, upstream)
    };

    Ok(body)
}

async fn buffered_response(ctx: ResponseCtx<'_>, upstream: reqwest::Response) -> Result<Response, ProxyError> {
    let ResponseCtx {
        state,
        handle,
        session_id,
        status,
        mut resp_headers,
        tts_request,
    } = ctx;

    let full = upstream
        .bytes()
        .await
        .map_err(|e| ProxyError::BackendUnavailable(format!("reading response body: {e}")))?;
    let body_text = String::from_utf8_lossy(&full).into_owned();

    let mut blocked = false;
    let mut terminated = false;
    if let Some(policy) = &state.policy {
        let mut session = handle.write().await;
        let result = policy.evaluate_response_content(&mut session, &body_text);
        blocked = result.should_block;
        terminated = result.should_terminate;
    }

    if terminated {
        let _ = state.sessions.terminate(session_id).await;
    }
    if blocked || terminated {
        state.sessions.write_if_flagged(session_id).await;
        return Err(ProxyError::ResponseBlocked {
            message: "Response violates security policy".to_string(),
            terminated,
        });
    }

    finish_bookkeeping(
        state,
        handle,
        session_id,
        full.len() as u64,
        &full,
        status,
        tts_request,
    )
    .await;

    echo_session_header(&mut resp_headers, &state.session_header, session_id);
    Ok(build_response(status, resp_headers, Body::from(full)))
}

fn streamed_async_scan_response(ctx: ResponseCtx<'_>, upstream: reqwest::Response
) -> Response {
    let ResponseCtx {
        state,
        handle,
        session_id,
        status,
        mut resp_headers,
        tts_request,
    } = ctx;
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    let state = state.clone();
    let handle = handle.clone();
    let session_id = session_id.to_string();
    echo_session_header(&mut resp_headers, &state.session_header, &session_id);

    tokio::spawn(async move {
        let mut upstream = upstream;
        let mut reconstructed = Vec::new();
        loop {
            match upstream.chunk().await {
                Ok(Some(chunk)) => {
                    reconstructed.extend_from_slice(&chunk);
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    return;
                }
            }
        }
        finish_bookkeeping(
            &state,
            &handle,
            &session_id,
            reconstructed.len() as u64,
            &reconstructed,
            status,
            tts_request,
        )
        .await;
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
    build_response(status, resp_headers, Body::from_stream(stream))
}

fn streamed_chunked_scan_response(ctx: ResponseCtx<'_>, upstream: reqwest::Response) -> Response {
    let ResponseCtx {
        state,
        handle,
        session_id,
        status,
        mut resp_headers,
        tts_request,
    } = ctx;
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    let state = state.clone();
    let handle = handle.clone();
    let session_id = session_id.to_string();
    echo_session_header(&mut resp_headers, &state.session_header, &session_id);

    tokio::spawn(async move {
        let Some(policy) = state.policy.as_ref() else {
            return;
        };
        let mut scanner = policy.response_scanner();
        let mut upstream = upstream;
        let mut delivered = Vec::new();
        let mut terminated = false;

        loop {
            let chunk = match upstream.chunk().await {
                Ok(Some(c)) => c,
                Ok(None) => break,
                Err(_) => break,
            };
            let result = scanner.scan_chunk(&chunk);
            for v in &result.violations {
                handle.write().await.record_violation(v.clone());
            }
            if tx.send(Ok(chunk.clone())).await.is_err() {
                return;
            }
            delivered.extend_from_slice(&chunk);
            if result.should_block || result.should_terminate {
                terminated = result.should_terminate;
                let _ = tx
                    .send(Ok(Bytes::from_static(STREAM_TERMINATED_MARKER.as_bytes())))
                    .await;
                break;
            }
        }

        if !terminated {
            let tail_result = scanner.finalize();
            for v in &tail_result.violations {
                handle.write().await.record_violation(v.clone());
            }
            if tail_result.should_block || tail_result.should_terminate {
                terminated = tail_result.should_terminate;
                let _ = tx
                    .send(Ok(Bytes::from_static(STREAM_TERMINATED_MARKER.as_bytes())))
                    .await;
            }
        }

        if terminated {
            let _ = state.sessions.terminate(&session_id).await;
        }
        finish_bookkeeping(
            &state,
            &handle,
            &session_id,
            delivered.len() as u64,
            &delivered,
            status,
            tts_request,
        )
        .await;
    });

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
    build_response(status, resp_headers, Body::from_stream(stream))
}

/// Step 12/13: token/tool-call extraction, session-metric evaluation, TTS
/// row, and a durable write for any session that ended up flagged.
async fn finish_bookkeeping(
    state: &Arc<AppState>,
    handle: &SessionHandle,
    session_id: &str,
    bytes_out: u64,
    body: &[u8],
    status: StatusCode,
    tts_request: Option<extraction::TtsRequest>,
) {
    let emitted = extraction::extract_emitted_tool_calls(body);
    let usage = extraction::extract_token_usage(body);

    if matches!(state.capture_mode, crate::capture::CaptureMode::All) {
        if let Some(capture) = &state.capture {
            let body_text = String::from_utf8_lossy(body).into_owned();
            capture
                .update_last_response(session_id, &body_text, status.as_u16())
                .await;
        }
    }

    {
        let mut session = handle.write().await;
        session.counters.bytes_out += bytes_out;
        session.counters.tool_calls.extend(emitted);
        if let Some(usage) = usage {
            session.counters.prompt_tokens += usage.prompt_tokens;
            session.counters.completion_tokens += usage.completion_tokens;
        }
    }

    if let Some(tts) = tts_request {
        let mut session = handle.write().await;
        let meta = session.metadata.get_or_insert_with(Default::default);
        meta.insert("last_tts_model".to_string(), tts.model.unwrap_or_default());
        meta.insert("last_tts_voice".to_string(), tts.voice.unwrap_or_default());
        if let Some(input) = tts.input {
            meta.insert("last_tts_input".to_string(), crate::session::types::truncate_body(&input, 200));
        }
        tracing::info!(session_id = %session_id, "recorded TTS request");
    }

    if let Some(policy) = &state.policy {
        let now = OffsetDateTime::now_utc();
        let metrics = {
            let session = handle.read().await;
            SessionMetrics {
                request_count: session.counters.request_count,
                bytes_in: session.counters.bytes_in,
                bytes_out: session.counters.bytes_out,
                duration_secs: (now - session.started_at).whole_seconds(),
                idle_secs: (now - session.last_activity_at).whole_seconds(),
                requests_last_minute: session.recent_requests.count_since(now - time::Duration::minutes(1)),
                tool_fanout: session.counters.tool_calls.len(),
                prompt_tokens: session.counters.prompt_tokens,
            }
        };
        let result = {
            let mut session = handle.write().await;
            policy.evaluate_session_metrics(&mut session, &metrics)
        };
        if result.should_terminate {
            let _ = state.sessions.terminate(session_id).await;
        }
    }

    state.sessions.write_if_flagged(session_id).await;
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_list_excludes_content_negotiation_headers() {
        assert!(HOP_BY_HOP.contains(&"connection"));
        assert!(!HOP_BY_HOP.contains(&"accept"));
    }
}
