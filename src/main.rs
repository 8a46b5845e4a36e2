mod capture;
mod config;
mod durable;
mod error;
mod extraction;
mod policy;
mod proxy;
mod router;
mod session;
mod state;
mod voice;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::any;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;

use capture::CaptureBuffer;
use config::{Args, ElidaConfig};
use durable::InMemoryDurableWriter;
use policy::PolicyEngine;
use router::BackendRouter;
use session::{InMemorySessionStore, SessionManager};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("elida=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let config = ElidaConfig::from(&args);

    let backends = config::default_backends();
    let backend_router = BackendRouter::new(backends, config.backend_header.clone())
        .map_err(|e| anyhow::anyhow!("startup: {e}"))?;

    let durable = InMemoryDurableWriter::new();
    let store = InMemorySessionStore::new();
    let sessions = Arc::new(SessionManager::new(
        store,
        durable.clone(),
        config.block_mode,
        config.idle_timeout_secs,
    ));

    let policy = config.policy_enabled.then(|| {
        PolicyEngine::from_preset(
            config.preset,
            config.policy_mode,
            config.stream_scan_mode,
            Vec::new(),
        )
    });
    let policy = policy.transpose()?;

    let capture = matches!(config.capture_mode, capture::CaptureMode::All)
        .then(|| CaptureBuffer::new(config.max_captured_per_session, config.max_capture_size));

    let voice = config::default_voice_config(config.voice_enabled);

    let app_state = Arc::new(AppState {
        router: backend_router,
        sessions: sessions.clone(),
        policy,
        capture,
        capture_mode: config.capture_mode,
        session_header: config.session_header.clone(),
        voice,
    });

    tokio::spawn(session::manager::run_idle_sweeper(sessions.clone()));

    let app = Router::new()
        .fallback(any(proxy::entry))
        .layer(CorsLayer::permissive())
        .with_state(app_state.clone());

    let addr: SocketAddr = config.listen.parse()?;
    tracing::info!(%addr, "elida proxy listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_state = app_state.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, terminating sessions");
            shutdown_state.sessions.terminate_all().await;
        })
        .await?;

    Ok(())
}
