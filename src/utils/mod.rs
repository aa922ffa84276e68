//! Utility modules
//!
//! Backoff, timeout handling, and string helpers shared by the services.

pub mod backoff;
pub mod string;
pub mod timeout;

pub use backoff::BackoffPolicy;
pub use string::{body_preview, redact, truncate_str, truncate_with_suffix};
pub use timeout::{next_within, with_timeout, TimeoutError};
