use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use super::AppState;

pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub solver: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// GET /health - Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: API_VERSION.to_string(),
        solver: state.solver.name(),
        timestamp: chrono::Utc::now(),
    };
    (StatusCode::OK, Json(response))
}

/// GET /health/live - Liveness probe
pub async fn liveness_check() -> impl IntoResponse {
    StatusCode::OK
}
