//! Proxy entry point (C6/C7, spec §4.6/§4.7): a single handler mounted on
//! every path, which detects a WebSocket upgrade and delegates accordingly.

pub mod http;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::response::Response;

use crate::state::AppState;

pub async fn entry(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    match ws {
        Some(upgrade) => ws::handle_upgrade(state, upgrade, addr, req).await,
        None => http::handle(state, addr, req).await,
    }
}
