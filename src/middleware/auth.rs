//! Authentication middleware
//!
//! Chat endpoints are protected by a static bearer token. The admin surface
//! uses HTTP Basic auth against the configured viewer and admin users and only
//! ever sees the resulting [`Capability`].

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use subtle::ConstantTimeEq;

use crate::config::UserGroups;
use crate::error::ApiError;
use crate::server::state::AppState;
use crate::services::Capability;
use crate::utils::truncate_with_suffix;

/// Middleware to require the chat bearer token
///
/// Accepts `Authorization: Bearer <token>`. When no token is configured every
/// request is rejected.
///
/// # Errors
/// - 401 Unauthorized: missing, wrong, or unconfigured token
pub async fn require_chat_token(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.settings.chat_token.as_deref() else {
        tracing::warn!("Chat request rejected: CHAT_TOKEN is not configured");
        return Err(ApiError::Unauthorized(
            "Chat API is disabled: no access token configured".to_string(),
        ));
    };

    let Some(token) = extract_bearer(request.headers()) else {
        tracing::warn!("Request missing bearer token");
        return Err(ApiError::Unauthorized(
            "Missing token. Include 'Authorization: Bearer <token>' in your request.".to_string(),
        ));
    };

    if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        tracing::warn!(token = %truncate_with_suffix(token, 4, "..."), "Invalid bearer token");
        return Err(ApiError::Unauthorized("Invalid token".to_string()));
    }

    Ok(next.run(request).await)
}

/// Extract the token of an `Authorization: Bearer` header
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Decode an `Authorization: Basic` header into `(user, password)`
pub fn extract_basic(headers: &HeaderMap) -> Option<(String, String)> {
    let encoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?
        .strip_prefix("Basic ")?
        .trim();
    let decoded = STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Resolve what the caller may do on the admin surface
///
/// Admin users are checked first; an admin is implicitly a viewer.
pub fn resolve_capability(headers: &HeaderMap, users: &UserGroups) -> Capability {
    let Some((user, password)) = extract_basic(headers) else {
        return Capability::None;
    };

    let matches = |expected: Option<&str>| {
        expected.is_some_and(|expected| constant_time_eq(password.as_bytes(), expected.as_bytes()))
    };

    if matches(users.admin_password(&user)) {
        Capability::Admin
    } else if matches(users.viewer_password(&user)) {
        Capability::Viewer
    } else {
        tracing::debug!(user = %user, "Admin surface login failed");
        Capability::None
    }
}

/// Compare two byte strings without an early exit on the first mismatch
fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.ct_eq(right).into()
}
