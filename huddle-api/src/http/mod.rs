// Module: http
// WebSocket signaling endpoint plus health and stats routes

pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use huddle_sfu::SfuManager;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::connections::ConnectionTracker;

/// Per-connection WebSocket limits
#[derive(Debug, Clone)]
pub struct WsSettings {
    /// Largest inbound frame accepted, in bytes
    pub max_message_size: usize,
    /// Bound of each connection's outbound queue
    pub outbound_channel_capacity: usize,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024,
            outbound_channel_capacity: 256,
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub sfu: Arc<SfuManager>,
    pub connections: ConnectionTracker,
    pub ws: WsSettings,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .merge(health::create_health_router())
        .route(ws_path, get(websocket::websocket_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
