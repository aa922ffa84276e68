//! API error types

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::schemas::openai::OpenAIErrorResponse;
use crate::services::{AdminError, DispatchError};

/// Challenge sent with every admin-surface 401
pub const BASIC_CHALLENGE: &str = r#"Basic realm="credential-admin", charset="UTF-8""#;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 401 carrying a Basic challenge so browsers prompt for admin users
    #[error("Unauthorized: {0}")]
    BasicChallenge(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) | ApiError::BasicChallenge(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI-style error body for this error
    pub fn body(&self) -> OpenAIErrorResponse {
        match self {
            ApiError::Unauthorized(msg) | ApiError::BasicChallenge(msg) => {
                OpenAIErrorResponse::authentication_error(msg)
            }
            ApiError::Forbidden(msg) => OpenAIErrorResponse::new("permission_error", msg),
            ApiError::InvalidRequest(msg) => OpenAIErrorResponse::invalid_request(msg),
            ApiError::NotFound(msg) => OpenAIErrorResponse::new("not_found_error", msg),
            ApiError::ServiceUnavailable(msg) => {
                OpenAIErrorResponse::with_code("server_error", msg, "pool_exhausted")
            }
            ApiError::Upstream(msg) => {
                OpenAIErrorResponse::with_code("server_error", msg, "upstream_error")
            }
            ApiError::Internal(err) => OpenAIErrorResponse::server_error(&err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        }

        let mut response = (status, Json(self.body())).into_response();
        if matches!(self, ApiError::BasicChallenge(_)) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(BASIC_CHALLENGE),
            );
        }
        response
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::PoolExhausted { .. } => ApiError::ServiceUnavailable(
                "No upstream credential is available, try again later".to_string(),
            ),
            DispatchError::Fatal { .. } => ApiError::Upstream(err.to_string()),
        }
    }
}

impl From<AdminError> for ApiError {
    fn from(err: AdminError) -> Self {
        let message = err.to_string();
        match err {
            AdminError::Unauthenticated => ApiError::BasicChallenge(message),
            AdminError::Forbidden => ApiError::Forbidden(message),
            AdminError::NotFound(_) => ApiError::NotFound(message),
            AdminError::Invalid(msg) => ApiError::InvalidRequest(msg),
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::egress::FailureClass;

    #[test]
    fn test_dispatch_error_status_codes() {
        let exhausted: ApiError = DispatchError::PoolExhausted { attempts: vec![] }.into();
        assert_eq!(exhausted.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(exhausted.body().error.code.as_deref(), Some("pool_exhausted"));

        let fatal: ApiError = DispatchError::Fatal {
            class: FailureClass::Blocked,
            message: "403 Forbidden".into(),
            attempts: vec![],
        }
        .into();
        assert_eq!(fatal.status(), StatusCode::BAD_GATEWAY);
        assert!(fatal.body().error.message.contains("403 Forbidden"));
    }

    #[test]
    fn test_admin_error_status_codes() {
        let cases = [
            (AdminError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (AdminError::Forbidden, StatusCode::FORBIDDEN),
            (AdminError::NotFound(7), StatusCode::NOT_FOUND),
            (AdminError::Invalid("x".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_basic_challenge_header() {
        let response = ApiError::from(AdminError::Unauthenticated).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            BASIC_CHALLENGE
        );

        let response = ApiError::Unauthorized("bad token".into()).into_response();
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
    }
}
