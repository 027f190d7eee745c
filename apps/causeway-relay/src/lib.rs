//! Causeway relay: a per-channel mailbox server that pairs two participants
//! and forwards their handshake messages (offers, answers, connectivity
//! candidates) until a direct peer transport comes up.
//!
//! The library surface exists so integration tests can embed the relay
//! in-process; the binary in `main.rs` is a thin wrapper around [`app`].

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod cli;
pub mod config;
pub mod registry;
pub mod websocket;

pub use config::Config;
pub use registry::ChannelRegistry;
pub use websocket::SignalingState;

#[derive(Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub channels: usize,
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<SignalingState>,
) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        channels: state.registry().channel_count(),
    })
}

/// Build the relay router: liveness probe plus the signaling WebSocket.
pub fn app(state: SignalingState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
