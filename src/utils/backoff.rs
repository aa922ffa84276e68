//! Backoff between dispatch attempts
//!
//! Transient upstream failures (rate limiting, 5xx, dropped connections) are
//! retried after an exponentially growing pause with optional jitter. The pause
//! is spent without holding a credential.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Pause before the first retry
    pub initial_delay: Duration,

    /// Upper bound on any single pause
    pub max_delay: Duration,

    /// Growth factor per retry
    pub multiplier: f64,

    /// Add up to one extra delay worth of random jitter
    pub use_jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry immediately, used by tests and by operators who want no pause
    pub fn none() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            use_jitter: false,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    /// Pause before retry number `retry` (0-indexed)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let base_ms = base_ms.min(self.max_delay.as_millis() as f64);

        if !base_ms.is_finite() || base_ms <= 0.0 {
            return Duration::ZERO;
        }

        let delay_ms = if self.use_jitter {
            base_ms + rand::thread_rng().gen_range(0.0..base_ms)
        } else {
            base_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}
