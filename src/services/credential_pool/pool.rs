//! Credential Pool Implementation
//!
//! All credential state lives in one `Vec` behind one mutex. Every operation
//! (acquire, release, stats, update) takes that lock for a short, I/O-free
//! critical section, so selecting a credential and marking it in use happen
//! atomically with respect to every other caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::credential::{
    AttemptOutcome, Credential, CredentialId, CredentialSeed, CredentialStatView,
};
use super::lease::CredentialLease;
use super::PoolError;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Configuration for credential pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Consecutive failures after which a credential cools down.
    /// `None` keeps every enabled credential selectable.
    pub consecutive_failure_limit: Option<u32>,
    /// How long a credential over the failure limit is skipped
    pub failure_cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            consecutive_failure_limit: None,
            failure_cooldown: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_limit(mut self, limit: u32) -> Self {
        self.consecutive_failure_limit = Some(limit);
        self
    }

    pub fn with_failure_cooldown(mut self, cooldown: Duration) -> Self {
        self.failure_cooldown = cooldown;
        self
    }
}

/// Admin mutation of a single credential; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialUpdate {
    pub secret: Option<String>,
    pub enabled: Option<bool>,
}

impl CredentialUpdate {
    pub fn secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            enabled: None,
        }
    }

    pub fn enabled(enabled: bool) -> Self {
        Self {
            secret: None,
            enabled: Some(enabled),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.secret.is_none() && self.enabled.is_none()
    }
}

// ============================================================================
// Credential Pool
// ============================================================================

/// Fair, exclusive pool of upstream credentials
///
/// Selection picks the enabled, free credential with the fewest total
/// attempts, breaking ties by lowest id. `acquire` never waits: when nothing
/// is free it fails with `PoolExhausted` and leaves queueing to the caller.
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Mutex<Vec<Credential>>,
    config: PoolConfig,
}

impl CredentialPool {
    /// Create a pool, assigning ids 1..=N in seed order
    pub fn new(seeds: Vec<CredentialSeed>, config: PoolConfig) -> Self {
        let now = Utc::now();
        let credentials = seeds
            .into_iter()
            .zip(1..)
            .map(|(seed, id)| Credential::from_seed(id, seed, now))
            .collect();

        Self {
            credentials: Mutex::new(credentials),
            config,
        }
    }

    /// A panicking holder cannot leave the records half-written (every
    /// mutation is a plain field store), so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Vec<Credential>> {
        self.credentials.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Select a credential and mark it in use
    pub fn acquire(self: &Arc<Self>) -> Result<CredentialLease, PoolError> {
        let now = Utc::now();
        let mut credentials = self.lock();

        let Some(credential) = credentials
            .iter_mut()
            .filter(|c| self.is_eligible(c, now))
            .min_by_key(|c| (c.total_attempts(), c.id))
        else {
            tracing::warn!("No credential available: all are disabled, in use, or cooling down");
            return Err(PoolError::PoolExhausted);
        };

        credential.in_use = true;
        let id = credential.id;
        let total_attempts = credential.total_attempts();
        let lease = CredentialLease::new(Arc::clone(self), id, credential.secret.clone());
        drop(credentials);

        tracing::debug!(credential_id = id, total_attempts, "Credential acquired");
        Ok(lease)
    }

    /// Acquire one specific credential if it is currently eligible
    pub fn acquire_id(self: &Arc<Self>, id: CredentialId) -> Option<CredentialLease> {
        let now = Utc::now();
        let mut credentials = self.lock();

        let credential = credentials.iter_mut().find(|c| c.id == id)?;
        if !self.is_eligible(credential, now) {
            return None;
        }
        credential.in_use = true;
        let lease = CredentialLease::new(Arc::clone(self), id, credential.secret.clone());
        drop(credentials);

        tracing::debug!(credential_id = id, "Credential re-acquired");
        Some(lease)
    }

    /// Clear the in-use mark and record the attempt outcome.
    /// Only reachable through `CredentialLease`, which guarantees a single call.
    pub(super) fn release(&self, id: CredentialId, outcome: &AttemptOutcome) {
        let now = Utc::now();
        let mut credentials = self.lock();

        match credentials.iter_mut().find(|c| c.id == id) {
            Some(credential) => {
                if !credential.in_use {
                    tracing::warn!(credential_id = id, "Releasing a credential that was not in use");
                }
                credential.record(outcome, now);
                let (success_count, failure_count) =
                    (credential.success_count, credential.failure_count);
                drop(credentials);

                match outcome {
                    AttemptOutcome::Success => tracing::debug!(
                        credential_id = id,
                        success_count,
                        failure_count,
                        "Credential released after success"
                    ),
                    AttemptOutcome::Failure(error) => tracing::info!(
                        credential_id = id,
                        success_count,
                        failure_count,
                        error = %error,
                        "Credential released after failure"
                    ),
                }
            }
            None => {
                drop(credentials);
                tracing::warn!(credential_id = id, "Release for unknown credential ignored");
            }
        }
    }

    /// Snapshot of every credential, or of a single one when `filter` is set
    pub fn list_stats(
        &self,
        filter: Option<CredentialId>,
    ) -> Result<Vec<CredentialStatView>, PoolError> {
        let now = Utc::now();
        let credentials = self.lock();

        match filter {
            Some(id) => credentials
                .iter()
                .find(|c| c.id == id)
                .map(|c| vec![c.view(self.is_eligible(c, now))])
                .ok_or(PoolError::NotFound(id)),
            None => Ok(credentials
                .iter()
                .map(|c| c.view(self.is_eligible(c, now)))
                .collect()),
        }
    }

    /// Replace a credential's secret and/or enabled flag.
    ///
    /// The in-use mark and counters are left alone, so this is safe while
    /// the credential is leased; the new secret applies to the next lease.
    pub fn update_credential(
        &self,
        id: CredentialId,
        update: CredentialUpdate,
    ) -> Result<CredentialStatView, PoolError> {
        let now = Utc::now();
        let mut credentials = self.lock();

        let credential = credentials
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(PoolError::NotFound(id))?;

        let secret_updated = update.secret.is_some();
        if let Some(secret) = update.secret {
            credential.secret = secret;
            credential.consecutive_failures = 0;
        }
        if let Some(enabled) = update.enabled {
            credential.enabled = enabled;
        }
        credential.last_updated_at = now;

        let view = credential.view(false);
        let available = self.is_eligible(credential, now);
        drop(credentials);

        tracing::info!(
            credential_id = id,
            secret_updated,
            enabled = view.enabled,
            "Credential updated"
        );
        Ok(CredentialStatView { available, ..view })
    }

    /// Aggregate counts for readiness checks and metrics
    pub fn summary(&self) -> PoolStats {
        let now = Utc::now();
        let credentials = self.lock();

        PoolStats {
            total: credentials.len(),
            enabled: credentials.iter().filter(|c| c.enabled).count(),
            in_use: credentials.iter().filter(|c| c.in_use).count(),
            available: credentials
                .iter()
                .filter(|c| self.is_eligible(c, now))
                .count(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn is_eligible(&self, credential: &Credential, now: DateTime<Utc>) -> bool {
        credential.enabled && !credential.in_use && !self.is_cooling_down(credential, now)
    }

    fn is_cooling_down(&self, credential: &Credential, now: DateTime<Utc>) -> bool {
        let Some(limit) = self.config.consecutive_failure_limit else {
            return false;
        };
        if credential.consecutive_failures < limit {
            return false;
        }
        let Some(last_failure) = credential.last_failure_at else {
            return false;
        };
        // A failure stamped in the future (clock step) counts as fresh
        now.signed_duration_since(last_failure)
            .to_std()
            .map(|elapsed| elapsed < self.config.failure_cooldown)
            .unwrap_or(true)
    }
}

// ============================================================================
// Pool Statistics
// ============================================================================

/// Aggregate counts over the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub enabled: usize,
    pub in_use: usize,
    /// Credentials `acquire` could pick right now
    pub available: usize,
}

impl PoolStats {
    /// At least one credential could eventually serve a request
    pub fn is_ready(&self) -> bool {
        self.enabled > 0
    }
}

// ============================================================================
// Tests
// ============================================================================
