//! Health check endpoints
//!
//! Liveness, readiness, and a summary health view for monitoring and
//! container orchestration.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::server::state::AppState;
use crate::services::PoolStats;

/// Response for the main health check endpoint
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub environment: String,
    pub uptime_seconds: u64,
    pub credentials: PoolStats,
    pub bypass_available: bool,
}

/// Response for readiness probe
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub credentials: PoolStats,
}

/// Response for liveness probe
#[derive(Serialize)]
pub struct LivenessResponse {
    pub alive: bool,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let credentials = state.pool.summary();
    let status = if credentials.is_ready() {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: state.settings.app_version.clone(),
        environment: state.settings.environment.to_string(),
        uptime_seconds: state.uptime_seconds(),
        credentials,
        bypass_available: state.settings.egress.bypass_available(),
    })
}

/// Readiness probe endpoint
///
/// Ready while at least one credential is enabled; in-use credentials still
/// count since they come back on release.
///
/// GET /ready
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let credentials = state.pool.summary();
    let ready = credentials.is_ready();

    let status = if ready {
        StatusCode::OK
    } else {
        tracing::warn!(total = credentials.total, "Service not ready: no enabled credential");
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(ReadinessResponse { ready, credentials }))
}

/// GET /liveness
pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { alive: true })
}
