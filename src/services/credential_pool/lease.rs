//! Exclusive credential lease
//!
//! A lease is handed out by `CredentialPool::acquire` and owns the credential's
//! in-use mark until it is released. Releasing consumes the lease, so an
//! attempt can report its outcome at most once; a lease dropped without an
//! outcome (cancelled request, panic, timeout) is recorded as a failure.

use std::fmt;
use std::sync::Arc;

use super::credential::{AttemptOutcome, CredentialId};
use super::pool::CredentialPool;

/// Error recorded when a lease is dropped without an explicit outcome
pub const CANCELLED_ERROR: &str = "attempt cancelled before completion";

pub struct CredentialLease {
    pool: Option<Arc<CredentialPool>>,
    id: CredentialId,
    /// Secret as it was at acquire time; admin updates apply to the next lease
    secret: String,
}

impl CredentialLease {
    pub(super) fn new(pool: Arc<CredentialPool>, id: CredentialId, secret: String) -> Self {
        Self {
            pool: Some(pool),
            id,
            secret,
        }
    }

    pub fn id(&self) -> CredentialId {
        self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Return the credential to the pool with the given outcome
    pub fn release(mut self, outcome: AttemptOutcome) {
        if let Some(pool) = self.pool.take() {
            pool.release(self.id, &outcome);
        }
    }

    pub fn succeed(self) {
        self.release(AttemptOutcome::Success);
    }

    pub fn fail(self, error: impl Into<String>) {
        self.release(AttemptOutcome::failure(error));
    }
}

impl Drop for CredentialLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            tracing::warn!(
                credential_id = self.id,
                "Credential lease dropped without an outcome, recording failure"
            );
            pool.release(self.id, &AttemptOutcome::failure(CANCELLED_ERROR));
        }
    }
}

impl fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLease")
            .field("id", &self.id)
            .field("released", &self.pool.is_none())
            .finish_non_exhaustive()
    }
}
