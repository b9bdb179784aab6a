//! Health check and statistics endpoints

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use huddle_sfu::ManagerStats;
use serde::Serialize;

use crate::connections::ConnectionStats;
use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub sfu: ManagerStats,
    pub connections: ConnectionStats,
}

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        sfu: state.sfu.stats(),
        connections: state.connections.stats(),
    })
}
