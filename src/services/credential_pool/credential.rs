//! Credential records and their read-only views
//!
//! A `Credential` is one upstream identity (a cookie) together with its usage
//! history. Records are only ever mutated by the pool, under its lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::redact;

/// Stable credential identifier, assigned at load time starting from 1
pub type CredentialId = u64;

/// Most secret characters left visible in a redacted view
const REDACTED_PREFIX_CHARS: usize = 8;

// ============================================================================
// Seed
// ============================================================================

/// Initial `(source, secret)` pair handed to the pool by the credential source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSeed {
    pub source: String,
    pub secret: String,
    pub enabled: bool,
}

impl CredentialSeed {
    pub fn new(source: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            secret: secret.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ============================================================================
// Attempt Outcome
// ============================================================================

/// Outcome reported back to the pool when an attempt holding a credential ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure(String),
}

impl AttemptOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        AttemptOutcome::Failure(error.into())
    }
}

// ============================================================================
// Credential
// ============================================================================

/// One upstream identity and its usage history
#[derive(Debug, Clone)]
pub struct Credential {
    pub(super) id: CredentialId,
    pub(super) source: String,
    pub(super) secret: String,
    pub(super) enabled: bool,
    pub(super) in_use: bool,
    pub(super) success_count: u64,
    pub(super) failure_count: u64,
    pub(super) last_success_at: Option<DateTime<Utc>>,
    pub(super) last_failure_at: Option<DateTime<Utc>>,
    pub(super) last_error: Option<String>,
    /// Failures since the last success or secret update
    pub(super) consecutive_failures: u32,
    pub(super) last_updated_at: DateTime<Utc>,
}

impl Credential {
    pub(super) fn from_seed(id: CredentialId, seed: CredentialSeed, now: DateTime<Utc>) -> Self {
        Self {
            id,
            source: seed.source,
            secret: seed.secret,
            enabled: seed.enabled,
            in_use: false,
            success_count: 0,
            failure_count: 0,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            consecutive_failures: 0,
            last_updated_at: now,
        }
    }

    /// Total attempts made with this credential, the pool's ranking key
    pub fn total_attempts(&self) -> u64 {
        self.success_count.saturating_add(self.failure_count)
    }

    /// Apply the outcome of a finished attempt and clear the in-use mark
    pub(super) fn record(&mut self, outcome: &AttemptOutcome, now: DateTime<Utc>) {
        self.in_use = false;
        match outcome {
            AttemptOutcome::Success => {
                self.success_count = self.success_count.saturating_add(1);
                self.last_success_at = Some(now);
                self.consecutive_failures = 0;
            }
            AttemptOutcome::Failure(error) => {
                self.failure_count = self.failure_count.saturating_add(1);
                self.last_failure_at = Some(now);
                self.last_error = Some(error.clone());
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
        }
    }

    pub(super) fn view(&self, available: bool) -> CredentialStatView {
        CredentialStatView {
            id: self.id,
            source: self.source.clone(),
            secret: self.secret.clone(),
            enabled: self.enabled,
            in_use: self.in_use,
            available,
            success_count: self.success_count,
            failure_count: self.failure_count,
            consecutive_failures: self.consecutive_failures,
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
            last_error: self.last_error.clone(),
            last_updated_at: self.last_updated_at,
        }
    }
}

// ============================================================================
// Stat View
// ============================================================================

/// Point-in-time snapshot of one credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialStatView {
    pub id: CredentialId,
    pub source: String,
    pub secret: String,
    pub enabled: bool,
    pub in_use: bool,
    /// Whether `acquire` could pick this credential right now
    pub available: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_updated_at: DateTime<Utc>,
}

impl CredentialStatView {
    /// Hide all but a short prefix of the secret
    pub fn redacted(mut self) -> Self {
        self.secret = redact(&self.secret, REDACTED_PREFIX_CHARS);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Credential {
        Credential::from_seed(1, CredentialSeed::new("a.txt", "sso=abcdefghijklmnop"), Utc::now())
    }

    #[test]
    fn test_record_success_resets_streak() {
        let mut cred = credential();
        cred.in_use = true;
        cred.record(&AttemptOutcome::failure("boom"), Utc::now());
        cred.record(&AttemptOutcome::failure("boom again"), Utc::now());
        assert_eq!(cred.consecutive_failures, 2);
        assert_eq!(cred.last_error.as_deref(), Some("boom again"));

        cred.in_use = true;
        cred.record(&AttemptOutcome::Success, Utc::now());
        assert!(!cred.in_use);
        assert_eq!(cred.consecutive_failures, 0);
        assert_eq!(cred.success_count, 1);
        assert_eq!(cred.failure_count, 2);
        assert_eq!(cred.total_attempts(), 3);
        // The last error survives a later success
        assert_eq!(cred.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn test_redacted_view_hides_secret() {
        let view = credential().view(true).redacted();
        assert_eq!(view.secret, "sso=abcd...");

        let short = Credential::from_seed(2, CredentialSeed::new("b.txt", "tiny"), Utc::now())
            .view(true)
            .redacted();
        assert_eq!(short.secret, "ti...");
        assert_ne!(short.secret, "tiny");
    }

    #[test]
    fn test_disabled_seed() {
        let seed = CredentialSeed::new("c.txt.ban", "x").disabled();
        assert!(!seed.enabled);
    }
}
