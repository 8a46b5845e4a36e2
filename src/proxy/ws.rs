//! WebSocket handler (C7, spec §4.7): bidirectional frame forwarding,
//! text-frame policy scanning, voice-session dispatch, keep-alive.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use time::OffsetDateTime;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as BackendMessage;

use crate::error::ProxyError;
use crate::session::store::SessionHandle;
use crate::session::types::KillSignal;
use crate::state::AppState;
use crate::voice::VoiceManager;

/// Only these headers cross the upgrade boundary to the backend (spec §4.7
/// step 3: "a fixed allowlist of forwarded headers").
const FORWARDED_HEADER_ALLOWLIST: &[&str] = &[
    "authorization",
    "x-api-key",
    "openai-beta",
    "anthropic-version",
    "anthropic-beta",
];

pub async fn handle_upgrade(
    state: Arc<AppState>,
    upgrade: WebSocketUpgrade,
    addr: SocketAddr,
    req: Request,
) -> Response {
    let headers = req.headers().clone();
    let path = req.uri().path().to_string();

    let header_backend = headers
        .get(state.router.header_name())
        .and_then(|v| v.to_str().ok());
    let backend = state.router.select(header_backend, None, &path).clone();

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

    let handle = match resolved {
        Ok(Some(h)) => h,
        Ok(None) => return ProxyError::SessionTerminated.into_response(),
        Err(crate::error::SessionError::Terminated(_)) => {
            return ProxyError::SessionTerminated.into_response()
        }
        Err(e) => return ProxyError::Other(e.into()).into_response(),
    };

    if handle.read().await.kill_signal.is_closed() {
        return ProxyError::SessionKilled.into_response();
    }

    let session_id = {
        let mut session = handle.write().await;
        session.counters.is_websocket = true;
        session.id.clone()
    };

    let backend_ws_url = to_ws_url(&backend.base_url, &path);
    let forward_headers: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            if FORWARDED_HEADER_ALLOWLIST.contains(&lower.as_str()) || lower == state.session_header.to_ascii_lowercase() {
                value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
            } else {
                None
            }
        })
        .collect();

    upgrade.on_upgrade(move |socket| async move {
        run(state, socket, backend_ws_url, forward_headers, handle, session_id).await;
    })
}

fn to_ws_url(base_url: &str, path: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    };
    format!("{}{}", ws_base.trim_end_matches('/'), path)
}

async fn run(
    state: Arc<AppState>,
    client_socket: WebSocket,
    backend_ws_url: String,
    forward_headers: Vec<(String, String)>,
    handle: SessionHandle,
    session_id: String,
) {
    let mut request = match backend_ws_url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "invalid backend websocket url");
            return;
        }
    };
    for (name, value) in &forward_headers {
        if let (Ok(n), Ok(v)) = (
            tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(name.as_bytes()),
            tokio_tungstenite::tungstenite::http::HeaderValue::from_str(value),
        ) {
            request.headers_mut().insert(n, v);
        }
    }

    let backend_ws = match tokio_tungstenite::connect_async(request).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "backend websocket dial failed");
            return;
        }
    };

    let (client_sink, client_stream) = client_socket.split();
    let (backend_sink, backend_stream) = backend_ws.split();

    let kill = { handle.read().await.kill_signal.clone() };
    let voice = Arc::new(VoiceManager::new(
        session_id.clone(),
        state.voice.clone(),
        state.clone(),
        handle.clone(),
    ));

    // spec §5: three cooperating tasks share this connection — an inbound
    // forwarder, an outbound forwarder, and this supervisor, which waits for
    // either forwarder to finish (or a kill signal) and reaps the other.
    let mut inbound = tokio::spawn(forward_client_to_backend(
        client_stream,
        backend_sink,
        state.clone(),
        handle.clone(),
        voice.clone(),
        kill.clone(),
    ));
    let mut outbound = tokio::spawn(forward_backend_to_client(
        backend_stream,
        client_sink,
        state.clone(),
        handle.clone(),
        voice.clone(),
        kill.clone(),
    ));

    tokio::select! {
        _ = &mut inbound => {}
        _ = &mut outbound => {}
        _ = kill.wait() => {}
    }
    inbound.abort();
    outbound.abort();

    // Each voice session already ran its CDR scan and durable write the
    // moment it ended (spec §4.9); this only terminates whatever is still
    // active when the WebSocket itself closes.
    voice.terminate_all("websocket_closed").await;
    {
        let mut session = handle.write().await;
        if session.is_active() {
            session.last_activity_at = OffsetDateTime::now_utc();
        }
    }
    state.sessions.write_if_flagged(&session_id).await;
}

async fn forward_client_to_backend(
    mut client_stream: futures_util::stream::SplitStream<WebSocket>,
    mut backend_sink: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        BackendMessage,
    >,
    state: Arc<AppState>,
    handle: SessionHandle,
    voice: Arc<VoiceManager>,
    kill: KillSignal,
) {
    loop {
        let msg = tokio::select! {
            _ = kill.wait() => break,
            m = client_stream.next() => m,
        };
        let Some(Ok(msg)) = msg else { break };

        {
            let mut session = handle.write().await;
            session.counters.ws_frames_in += 1;
        }

        let forward = match &msg {
            AxumMessage::Text(text) => {
                handle_outgoing_text(&state, &handle, &voice, text, false).await
            }
            AxumMessage::Binary(bytes) => {
                voice.on_binary_frame(bytes, false).await;
                {
                    let mut session = handle.write().await;
                    session.counters.bytes_in += bytes.len() as u64;
                }
                true
            }
            _ => true,
        };

        if !forward {
            continue;
        }

        let Some(converted) = to_backend_message(msg) else {
            continue;
        };
        if backend_sink.send(converted).await.is_err() {
            break;
        }
    }
}

async fn forward_backend_to_client(
    mut backend_stream: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    >,
    mut client_sink: futures_util::stream::SplitSink<WebSocket, AxumMessage>,
    state: Arc<AppState>,
    handle: SessionHandle,
    voice: Arc<VoiceManager>,
    kill: KillSignal,
) {
    loop {
        let msg = tokio::select! {
            _ = kill.wait() => break,
            m = backend_stream.next() => m,
        };
        let Some(Ok(msg)) = msg else { break };

        {
            let mut session = handle.write().await;
            session.counters.ws_frames_out += 1;
        }

        let forward = match &msg {
            BackendMessage::Text(text) => handle_outgoing_text(&state, &handle, &voice, text, true).await,
            BackendMessage::Binary(bytes) => {
                voice.on_binary_frame(bytes, true).await;
                {
                    let mut session = handle.write().await;
                    session.counters.bytes_out += bytes.len() as u64;
                }
                true
            }
            _ => true,
        };

        if !forward {
            continue;
        }

        let Some(converted) = to_client_message(msg) else {
            continue;
        };
        if client_sink.send(converted).await.is_err() {
            break;
        }
    }
}

/// Scan a text frame as request-content (inbound) or response-content
/// (outbound) and dispatch it to the voice-control parser. Returns whether
/// the frame should still be forwarded (spec §4.7: `block` drops the frame
/// but keeps the channel open; `terminate` is handled by the caller's kill
/// check on the next iteration once the session is terminated here).
async fn handle_outgoing_text(
    state: &Arc<AppState>,
    handle: &SessionHandle,
    voice: &Arc<VoiceManager>,
    text: &str,
    outbound: bool,
) -> bool {
    {
        let mut session = handle.write().await;
        if outbound {
            session.counters.bytes_out += text.len() as u64;
        } else {
            session.counters.bytes_in += text.len() as u64;
        }
    }

    voice.on_text_frame(text, outbound).await;

    let Some(policy) = &state.policy else {
        return true;
    };

    let result = {
        let mut session = handle.write().await;
        if outbound {
            policy.evaluate_response_content(&mut session, text)
        } else {
            policy.evaluate_request_content(&mut session, text)
        }
    };

    if result.should_terminate {
        let session_id = handle.read().await.id.clone();
        let _ = state.sessions.terminate(&session_id).await;
        return false;
    }
    if result.should_block {
        return false;
    }
    true
}

fn to_backend_message(msg: AxumMessage) -> Option<BackendMessage> {
    match msg {
        AxumMessage::Text(t) => Some(BackendMessage::Text(t.to_string())),
        AxumMessage::Binary(b) => Some(BackendMessage::Binary(b.to_vec())),
        AxumMessage::Ping(p) => Some(BackendMessage::Ping(p.to_vec())),
        AxumMessage::Pong(p) => Some(BackendMessage::Pong(p.to_vec())),
        AxumMessage::Close(_) => Some(BackendMessage::Close(None)),
    }
}

fn to_client_message(msg: BackendMessage) -> Option<AxumMessage> {
    match msg {
        BackendMessage::Text(t) => Some(AxumMessage::Text(t)),
        BackendMessage::Binary(b) => Some(AxumMessage::Binary(b)),
        BackendMessage::Ping(p) => Some(AxumMessage::Ping(p)),
        BackendMessage::Pong(p) => Some(AxumMessage::Pong(p)),
        BackendMessage::Close(_) => Some(AxumMessage::Close(None)),
        BackendMessage::Frame(_) => None,
    }
}

/// Idle keep-alive: axum answers Ping automatically, so no dedicated ticker
/// task is required for the client side. The backend connection relies on
/// `tokio-tungstenite`'s automatic pong responses.
#[allow(dead_code)]
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
