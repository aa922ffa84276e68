//! Middleware module
//!
//! Contains HTTP middleware for authentication and request logging.

pub mod auth;
pub mod logging;

// Re-export commonly used items
pub use auth::{require_chat_token, resolve_capability};
pub use logging::{log_request, TraceId, REQUEST_ID_HEADER, TRACE_ID_HEADER};
