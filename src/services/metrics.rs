//! Prometheus metrics
//!
//! Counters are bumped by the dispatch engine as attempts finish; pool gauges
//! are refreshed from a pool summary right before each scrape.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use super::credential_pool::PoolStats;
use super::egress::{EgressPath, FailureClass};

/// Terminal result of one logical request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestResult {
    Success,
    PoolExhausted,
    Failed,
}

impl RequestResult {
    fn as_str(&self) -> &'static str {
        match self {
            RequestResult::Success => "success",
            RequestResult::PoolExhausted => "pool_exhausted",
            RequestResult::Failed => "failed",
        }
    }
}

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    upstream_attempts: IntCounterVec,
    requests: IntCounterVec,
    credentials_total: IntGauge,
    credentials_enabled: IntGauge,
    credentials_in_use: IntGauge,
    credentials_available: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let upstream_attempts = IntCounterVec::new(
            Opts::new("upstream_attempts_total", "Upstream calls by egress path and outcome"),
            &["egress", "outcome"],
        )?;
        let requests = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Logical chat requests by terminal result"),
            &["result"],
        )?;
        let credentials_total = IntGauge::new("credentials_total", "Credentials loaded")?;
        let credentials_enabled = IntGauge::new("credentials_enabled", "Credentials enabled")?;
        let credentials_in_use =
            IntGauge::new("credentials_in_use", "Credentials held by an in-flight attempt")?;
        let credentials_available =
            IntGauge::new("credentials_available", "Credentials selectable right now")?;

        registry.register(Box::new(upstream_attempts.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(credentials_total.clone()))?;
        registry.register(Box::new(credentials_enabled.clone()))?;
        registry.register(Box::new(credentials_in_use.clone()))?;
        registry.register(Box::new(credentials_available.clone()))?;

        Ok(Self {
            registry,
            upstream_attempts,
            requests,
            credentials_total,
            credentials_enabled,
            credentials_in_use,
            credentials_available,
        })
    }

    /// Record one finished upstream attempt; `None` means success
    pub fn record_attempt(&self, egress: EgressPath, failure: Option<FailureClass>) {
        let outcome = failure.map_or("success", |class| class.as_str());
        self.upstream_attempts
            .with_label_values(&[egress.as_str(), outcome])
            .inc();
    }

    pub fn record_request(&self, result: RequestResult) {
        self.requests.with_label_values(&[result.as_str()]).inc();
    }

    pub fn observe_pool(&self, stats: &PoolStats) {
        self.credentials_total.set(stats.total as i64);
        self.credentials_enabled.set(stats.enabled as i64);
        self.credentials_in_use.set(stats.in_use as i64);
        self.credentials_available.set(stats.available as i64);
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn attempts(&self, egress: EgressPath, outcome: &str) -> u64 {
        self.upstream_attempts
            .with_label_values(&[egress.as_str(), outcome])
            .get()
    }

    #[cfg(test)]
    pub(crate) fn requests(&self, result: RequestResult) -> u64 {
        self.requests.with_label_values(&[result.as_str()]).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_values() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_attempt(EgressPath::Direct, Some(FailureClass::Blocked));
        metrics.record_attempt(EgressPath::Bypass, None);
        metrics.record_request(RequestResult::Success);
        metrics.observe_pool(&PoolStats {
            total: 3,
            enabled: 2,
            in_use: 1,
            available: 1,
        });

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"upstream_attempts_total{egress="direct",outcome="blocked"} 1"#));
        assert!(text.contains(r#"upstream_attempts_total{egress="bypass",outcome="success"} 1"#));
        assert!(text.contains(r#"gateway_requests_total{result="success"} 1"#));
        assert!(text.contains("credentials_enabled 2"));
        assert!(text.contains("credentials_in_use 1"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = GatewayMetrics::new().unwrap();
        let b = GatewayMetrics::new().unwrap();
        a.record_attempt(EgressPath::Direct, None);
        assert_eq!(a.attempts(EgressPath::Direct, "success"), 1);
        assert_eq!(b.attempts(EgressPath::Direct, "success"), 0);
    }
}
