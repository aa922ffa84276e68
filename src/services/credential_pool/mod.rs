//! Credential Pool
//!
//! Hands out upstream credentials (cookies) one caller at a time, picking the
//! least-used enabled credential and recording the outcome of every attempt.
//!
//! ## Lifecycle
//!
//! ```text
//! acquire() ──► CredentialLease ──► succeed() / fail(err) / drop
//!                    │                         │
//!                    └── exclusive use ────────┴──► counters updated, free again
//! ```

mod credential;
mod lease;
mod pool;

pub use credential::{AttemptOutcome, Credential, CredentialId, CredentialSeed, CredentialStatView};
pub use lease::{CredentialLease, CANCELLED_ERROR};
pub use pool::{CredentialPool, CredentialUpdate, PoolConfig, PoolStats};

use thiserror::Error;

/// Credential pool errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("No credential available")]
    PoolExhausted,

    #[error("Credential {0} not found")]
    NotFound(CredentialId),
}
