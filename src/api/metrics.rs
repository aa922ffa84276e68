//! Prometheus scrape endpoint

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};

use crate::error::ApiError;
use crate::server::state::AppState;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    state.metrics.observe_pool(&state.pool.summary());
    let body = state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Failed to render metrics: {e}")))?;
    Ok(([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response())
}
