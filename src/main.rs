//! Society Relay Server
//!
//! The real-time backbone of the society portal. A lightweight WebSocket
//! relay that provides:
//!
//! 1. **Presence**: tracks which resident/tenant/security identities have a
//!    live connection — one connection per identity, last registration wins.
//!
//! 2. **Chat delivery tracking**: persists every chat message and walks it
//!    through `sent → delivered → read`, pushing the undelivered backlog when
//!    a recipient reconnects and emitting per-message status receipts.
//!
//! 3. **Call signaling**: relays WebRTC SDP offers/answers and ICE candidates
//!    between a caller and callee so the media session is peer-to-peer — the
//!    relay never sees audio or video, only opaque signaling blobs.

mod calls;
mod error;
mod handler;
mod protocol;
mod registry;
mod state;
mod store;

use std::path::PathBuf;
use std::time::Duration;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "society-relay", version, about = "Society portal presence & signaling relay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,

    /// SQLite database path for the message store (in-memory if unset)
    #[arg(long, env = "RELAY_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Seconds an unanswered call rings before timing out
    #[arg(long, default_value_t = 30, env = "RING_TIMEOUT_SECS")]
    ring_timeout_secs: u64,

    /// Seconds a finished call session is retained before cleanup
    #[arg(long, default_value_t = 300, env = "CALL_RETENTION_SECS")]
    call_retention_secs: i64,

    /// Cleanup interval in seconds
    #[arg(long, default_value_t = 300, env = "CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: u64,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "society_relay=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = RelayConfig {
        port: args.port,
        db_path: args.db_path,
        ring_timeout_secs: args.ring_timeout_secs,
        call_retention_secs: args.call_retention_secs,
        cleanup_interval_secs: args.cleanup_interval_secs,
    };

    match &config.db_path {
        Some(path) => tracing::info!(path = %path.display(), "Message store on disk"),
        None => tracing::info!("Message store in memory (no --db-path configured)"),
    }

    let state = match RelayState::new(config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open message store");
            std::process::exit(1);
        }
    };

    // Spawn periodic cleanup task
    let cleanup_state = state.clone();
    let cleanup_interval = cleanup_state.config.cleanup_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval));
        loop {
            interval.tick().await;
            cleanup_state.cleanup_expired();
        }
    });

    // Build router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/info", get(info_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.port);
    tracing::info!("Society relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "society-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "online_clients": state.registry.online_count(),
        "active_calls": state.calls.active_count(),
        "stored_messages": state.store.message_count().unwrap_or(-1),
    }))
}

/// Server info endpoint — returns metadata and current load.
/// Also useful for client-side ping measurement (time the round-trip).
async fn info_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "service": "society-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "online_clients": state.registry.online_count(),
        "active_calls": state.calls.active_count(),
        "ring_timeout_secs": state.config.ring_timeout_secs,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
