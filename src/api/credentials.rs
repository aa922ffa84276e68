//! Credential admin endpoints
//!
//! Basic-auth protected views over the credential pool. Capability
//! resolution happens here; the admin surface only sees the result.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};

use crate::error::ApiError;
use crate::middleware::resolve_capability;
use crate::schemas::admin::{CredentialFilter, CredentialListResponse, UpdateCredentialRequest};
use crate::server::state::AppState;
use crate::services::{CredentialId, CredentialStatView, UpdateReport};

/// GET /api/credentials - List credential stats, optionally for one id
pub async fn list_credentials(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<CredentialFilter>,
) -> Result<Json<CredentialListResponse>, ApiError> {
    let capability = resolve_capability(&headers, &state.settings.users);
    let credentials = state.admin.list(capability, filter.id)?;
    Ok(Json(CredentialListResponse {
        total: credentials.len(),
        credentials,
    }))
}

/// GET /api/credentials/:id
pub async fn get_credential(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<CredentialId>,
) -> Result<Json<CredentialStatView>, ApiError> {
    let capability = resolve_capability(&headers, &state.settings.users);
    let view = state
        .admin
        .list(capability, Some(id))?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::NotFound(format!("Credential {id} not found")))?;
    Ok(Json(view))
}

/// POST /api/credentials/:id - Update secret and/or enabled flag (admin only)
pub async fn update_credential(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<CredentialId>,
    Json(body): Json<UpdateCredentialRequest>,
) -> Result<Json<UpdateReport>, ApiError> {
    let capability = resolve_capability(&headers, &state.settings.users);
    let report = state.admin.update(capability, id, body.into()).await?;
    Ok(Json(report))
}

/// GET /logout - Drop cached Basic credentials in the browser
pub async fn logout() -> ApiError {
    ApiError::BasicChallenge("Logged out".to_string())
}
