//! Dispatch/retry engine
//!
//! Turns one logical chat request into a bounded sequence of upstream
//! attempts. Each attempt acquires a credential, picks an egress path, calls
//! the upstream under a deadline and reports the outcome back to the pool
//! before the next step is decided:
//!
//! ```text
//! acquire ──► attempt(direct) ──► success ──────────────────────► DONE
//!                   │
//!                   ├─ blocked ── bypass configured, budget left ─► attempt(bypass)
//!                   ├─ transient ─ budget left ──── backoff ──────► attempt(same path)
//!                   └─ fatal / no path left / budget spent ───────► FAILED
//! ```
//!
//! Every lease is released exactly once on every path out of an attempt,
//! including deadline expiry and cancellation of the calling task.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::credential_pool::{CredentialId, CredentialLease, CredentialPool};
use super::egress::{EgressPath, EgressSelector, FailureClass};
use super::metrics::{GatewayMetrics, RequestResult};
use super::upstream::{TokenStream, Upstream, UpstreamError, UpstreamRequest};
use crate::utils::{next_within, with_timeout, BackoffPolicy, TimeoutError};

// ============================================================================
// Configuration
// ============================================================================

/// Which credential a retry after a failed attempt uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialRotation {
    /// Ask the pool for the least-used credential again
    #[default]
    Reacquire,
    /// Retry with the same credential when it is still eligible
    Reuse,
}

impl fmt::Display for CredentialRotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialRotation::Reacquire => write!(f, "reacquire"),
            CredentialRotation::Reuse => write!(f, "reuse"),
        }
    }
}

impl std::str::FromStr for CredentialRotation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reacquire" => Ok(CredentialRotation::Reacquire),
            "reuse" => Ok(CredentialRotation::Reuse),
            _ => anyhow::bail!("Invalid credential rotation: {}. Expected: reacquire or reuse", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Upstream calls per logical request, all egress paths combined
    pub max_attempts: u32,
    /// Deadline for one attempt; for streams, until the upstream accepts
    pub attempt_timeout: Duration,
    /// Longest silence tolerated between streamed tokens
    pub stream_idle_timeout: Duration,
    pub rotation: CredentialRotation,
    /// Pause before retrying a transient failure
    pub backoff: BackoffPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            attempt_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(60),
            rotation: CredentialRotation::Reacquire,
            backoff: BackoffPolicy::default(),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Record of one upstream call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub credential_id: CredentialId,
    pub egress: EgressPath,
    /// `None` when the attempt succeeded
    pub failure: Option<FailureClass>,
    pub error: Option<String>,
}

impl Attempt {
    fn succeeded(credential_id: CredentialId, egress: EgressPath) -> Self {
        Self {
            credential_id,
            egress,
            failure: None,
            error: None,
        }
    }

    fn failed(
        credential_id: CredentialId,
        egress: EgressPath,
        class: FailureClass,
        error: String,
    ) -> Self {
        Self {
            credential_id,
            egress,
            failure: Some(class),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Fully buffered completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub credential_id: CredentialId,
    pub attempts: Vec<Attempt>,
}

/// Streamed completion. The credential stays leased until `tokens` ends,
/// fails, or is dropped.
pub struct CompletionStream {
    pub credential_id: CredentialId,
    pub attempts: Vec<Attempt>,
    pub tokens: TokenStream,
}

impl fmt::Debug for CompletionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionStream")
            .field("credential_id", &self.credential_id)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("No credential available")]
    PoolExhausted { attempts: Vec<Attempt> },

    #[error("Request failed after {} attempt(s): {message}", .attempts.len())]
    Fatal {
        class: FailureClass,
        message: String,
        attempts: Vec<Attempt>,
    },
}

impl DispatchError {
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            DispatchError::PoolExhausted { attempts } | DispatchError::Fatal { attempts, .. } => {
                attempts
            }
        }
    }
}

/// Terminal result of a streamed request, counted once. A stream dropped
/// before it finished counts as failed.
struct RequestRecord {
    metrics: GatewayMetrics,
    finished: bool,
}

impl RequestRecord {
    fn new(metrics: GatewayMetrics) -> Self {
        Self {
            metrics,
            finished: false,
        }
    }

    fn finish(&mut self, result: RequestResult) {
        if !self.finished {
            self.finished = true;
            self.metrics.record_request(result);
        }
    }
}

impl Drop for RequestRecord {
    fn drop(&mut self) {
        self.finish(RequestResult::Failed);
    }
}

/// Outcome of a successful attempt, lease still held
struct Settled<T> {
    lease: CredentialLease,
    output: T,
    attempts: Vec<Attempt>,
}

// ============================================================================
// Engine
// ============================================================================

pub struct DispatchEngine {
    pool: Arc<CredentialPool>,
    upstream: Arc<dyn Upstream>,
    selector: EgressSelector,
    config: DispatchConfig,
    metrics: GatewayMetrics,
}

impl DispatchEngine {
    pub fn new(
        pool: Arc<CredentialPool>,
        upstream: Arc<dyn Upstream>,
        selector: EgressSelector,
        config: DispatchConfig,
        metrics: GatewayMetrics,
    ) -> Self {
        tracing::info!(
            max_attempts = config.max_attempts,
            attempt_timeout_ms = config.attempt_timeout.as_millis() as u64,
            rotation = %config.rotation,
            bypass_available = selector.bypass_available(),
            "Initialized dispatch engine"
        );
        Self {
            pool,
            upstream,
            selector,
            config,
            metrics,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Run a request to completion and return the whole response text
    pub async fn dispatch(&self, request: &UpstreamRequest) -> Result<Completion, DispatchError> {
        let Settled {
            lease,
            output: text,
            attempts,
        } = self.drive(request, collect_text).await?;

        let credential_id = lease.id();
        lease.succeed();
        self.metrics.record_request(RequestResult::Success);

        Ok(Completion {
            text,
            credential_id,
            attempts,
        })
    }

    /// Run a request until the upstream accepts it, then hand back the token
    /// stream. Failures after that point end the stream with an error item.
    pub async fn dispatch_stream(
        &self,
        request: &UpstreamRequest,
    ) -> Result<CompletionStream, DispatchError> {
        let Settled {
            lease,
            output: tokens,
            attempts,
        } = self
            .drive(request, |tokens| futures::future::ready(Ok(tokens)))
            .await?;

        let credential_id = lease.id();
        let idle = self.config.stream_idle_timeout;
        let record = RequestRecord::new(self.metrics.clone());

        let tokens: TokenStream = Box::pin(async_stream::stream! {
            let lease = lease;
            let mut record = record;
            let mut tokens = tokens;
            loop {
                match next_within(idle, &mut tokens).await {
                    Ok(Some(Ok(token))) => {
                        yield Ok(token);
                    }
                    Ok(Some(Err(error))) => {
                        tracing::warn!(credential_id, error = %error, "Upstream stream failed mid-response");
                        lease.fail(error.to_string());
                        record.finish(RequestResult::Failed);
                        yield Err(error);
                        return;
                    }
                    Ok(None) => {
                        lease.succeed();
                        record.finish(RequestResult::Success);
                        return;
                    }
                    Err(after) => {
                        let error = UpstreamError::Transient(format!("stream stalled for {after:?}"));
                        tracing::warn!(credential_id, error = %error, "Upstream stream went idle");
                        lease.fail(error.to_string());
                        record.finish(RequestResult::Failed);
                        yield Err(error);
                        return;
                    }
                }
            }
        });

        Ok(CompletionStream {
            credential_id,
            attempts,
            tokens,
        })
    }

    /// The retry state machine. `finish` turns an accepted upstream stream
    /// into the attempt's output and runs inside the attempt deadline.
    async fn drive<T, F, Fut>(
        &self,
        request: &UpstreamRequest,
        finish: F,
    ) -> Result<Settled<T>, DispatchError>
    where
        F: Fn(TokenStream) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let max_attempts = self.config.max_attempts as usize;
        let mut attempts: Vec<Attempt> = Vec::with_capacity(max_attempts);
        let mut egress = self.selector.initial();
        let mut previous: Option<CredentialId> = None;
        let mut transient_retries = 0u32;

        loop {
            let lease = match self.acquire(previous) {
                Ok(lease) => lease,
                Err(error) => {
                    tracing::warn!(
                        attempts = attempts.len(),
                        error = %error,
                        "Dispatch stopped: no credential to attempt with"
                    );
                    self.metrics.record_request(RequestResult::PoolExhausted);
                    return Err(DispatchError::PoolExhausted { attempts });
                }
            };
            let credential_id = lease.id();

            tracing::debug!(
                credential_id,
                egress = %egress,
                attempt = attempts.len() + 1,
                "Starting upstream attempt"
            );

            let call = async {
                let tokens = self.upstream.open(request, lease.secret(), egress).await?;
                finish(tokens).await
            };
            let result = match with_timeout(self.config.attempt_timeout, call).await {
                Ok(output) => Ok(output),
                Err(TimeoutError::Timeout(after)) => Err(UpstreamError::timed_out(after)),
                Err(TimeoutError::Inner(error)) => Err(error),
            };

            let error = match result {
                Ok(output) => {
                    self.metrics.record_attempt(egress, None);
                    attempts.push(Attempt::succeeded(credential_id, egress));
                    tracing::info!(
                        credential_id,
                        egress = %egress,
                        attempts = attempts.len(),
                        "Upstream attempt succeeded"
                    );
                    return Ok(Settled {
                        lease,
                        output,
                        attempts,
                    });
                }
                Err(error) => error,
            };

            let class = error.class();
            let message = error.to_string();
            lease.fail(message.clone());
            self.metrics.record_attempt(egress, Some(class));
            attempts.push(Attempt::failed(credential_id, egress, class, message.clone()));

            let next = self.selector.next(egress, class);
            match next {
                Some(next_egress) if attempts.len() < max_attempts => {
                    tracing::info!(
                        credential_id,
                        egress = %egress,
                        next_egress = %next_egress,
                        class = %class,
                        error = %message,
                        "Upstream attempt failed, retrying"
                    );
                    if class == FailureClass::Transient {
                        let delay = self.config.backoff.delay_for(transient_retries);
                        transient_retries += 1;
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    egress = next_egress;
                    previous = Some(credential_id);
                }
                _ => {
                    let message = match next {
                        Some(_) => format!(
                            "retry budget of {max_attempts} attempt(s) exhausted, last error: {message}"
                        ),
                        None => message,
                    };
                    tracing::warn!(
                        credential_id,
                        egress = %egress,
                        class = %class,
                        attempts = attempts.len(),
                        error = %message,
                        "Dispatch failed"
                    );
                    self.metrics.record_request(RequestResult::Failed);
                    return Err(DispatchError::Fatal {
                        class,
                        message,
                        attempts,
                    });
                }
            }
        }
    }

    fn acquire(
        &self,
        previous: Option<CredentialId>,
    ) -> Result<CredentialLease, super::credential_pool::PoolError> {
        if let (CredentialRotation::Reuse, Some(id)) = (self.config.rotation, previous) {
            if let Some(lease) = self.pool.acquire_id(id) {
                return Ok(lease);
            }
            tracing::debug!(credential_id = id, "Previous credential unavailable, acquiring another");
        }
        self.pool.acquire()
    }
}

async fn collect_text(mut tokens: TokenStream) -> Result<String, UpstreamError> {
    let mut text = String::new();
    while let Some(token) = tokens.next().await {
        text.push_str(&token?);
    }
    Ok(text)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::credential_pool::{
        CredentialSeed, CredentialStatView, PoolConfig, PoolError, CANCELLED_ERROR,
    };
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    enum Step {
        Reply(Vec<Result<String, UpstreamError>>),
        ReplyThenStall(Vec<String>),
        Fail(UpstreamError),
        Hang,
    }

    fn reply(tokens: &[&str]) -> Step {
        Step::Reply(tokens.iter().map(|t| Ok(t.to_string())).collect())
    }

    fn blocked() -> Step {
        Step::Fail(UpstreamError::Blocked("403 Forbidden".into()))
    }

    fn transient() -> Step {
        Step::Fail(UpstreamError::Transient("502 Bad Gateway".into()))
    }

    /// Upstream that plays back a fixed script and records every call
    #[derive(Default)]
    struct ScriptedUpstream {
        script: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<(String, EgressPath)>>,
    }

    impl ScriptedUpstream {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(steps.into()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<(String, EgressPath)> {
            self.calls.lock().unwrap().clone()
        }

        fn egresses(&self) -> Vec<EgressPath> {
            self.calls().into_iter().map(|(_, egress)| egress).collect()
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn open(
            &self,
            _request: &UpstreamRequest,
            secret: &str,
            egress: EgressPath,
        ) -> Result<TokenStream, UpstreamError> {
            self.calls.lock().unwrap().push((secret.to_string(), egress));
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Step::Reply(items)) => Ok(Box::pin(stream::iter(items))),
                Some(Step::ReplyThenStall(tokens)) => Ok(Box::pin(
                    stream::iter(tokens.into_iter().map(Ok)).chain(stream::pending()),
                )),
                Some(Step::Fail(error)) => Err(error),
                Some(Step::Hang) => futures::future::pending().await,
                None => Err(UpstreamError::Fatal("script exhausted".into())),
            }
        }
    }

    fn pool(count: usize) -> Arc<CredentialPool> {
        let seeds = (1..=count)
            .map(|i| CredentialSeed::new(format!("cookie_{i}.txt"), format!("secret-{i}")))
            .collect();
        Arc::new(CredentialPool::new(seeds, PoolConfig::default()))
    }

    fn config(max_attempts: u32) -> DispatchConfig {
        DispatchConfig {
            max_attempts,
            attempt_timeout: Duration::from_secs(5),
            stream_idle_timeout: Duration::from_secs(5),
            rotation: CredentialRotation::Reacquire,
            backoff: BackoffPolicy::none(),
        }
    }

    fn engine(
        pool: &Arc<CredentialPool>,
        upstream: &Arc<ScriptedUpstream>,
        bypass: bool,
        config: DispatchConfig,
    ) -> DispatchEngine {
        DispatchEngine::new(
            Arc::clone(pool),
            Arc::clone(upstream) as Arc<dyn Upstream>,
            EgressSelector::new(bypass),
            config,
            GatewayMetrics::new().unwrap(),
        )
    }

    fn request() -> UpstreamRequest {
        UpstreamRequest {
            model: "grok-3".into(),
            messages: vec![crate::services::upstream::PromptMessage::new("user", "hi")],
        }
    }

    fn stat(pool: &CredentialPool, id: CredentialId) -> CredentialStatView {
        pool.list_stats(Some(id)).unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let pool = pool(2);
        let upstream = ScriptedUpstream::new(vec![reply(&["Hello", ", ", "world"])]);
        let engine = engine(&pool, &upstream, false, config(3));

        let completion = engine.dispatch(&request()).await.unwrap();
        assert_eq!(completion.text, "Hello, world");
        assert_eq!(completion.credential_id, 1);
        assert_eq!(completion.attempts.len(), 1);
        assert!(completion.attempts[0].is_success());

        let view = stat(&pool, 1);
        assert_eq!(view.success_count, 1);
        assert!(!view.in_use);
    }

    #[tokio::test]
    async fn test_block_escalates_to_bypass() {
        let pool = pool(2);
        let upstream = ScriptedUpstream::new(vec![blocked(), reply(&["ok"])]);
        let engine = engine(&pool, &upstream, true, config(3));

        let completion = engine.dispatch(&request()).await.unwrap();
        assert_eq!(completion.text, "ok");
        assert_eq!(completion.attempts.len(), 2);
        assert_eq!(upstream.egresses(), vec![EgressPath::Direct, EgressPath::Bypass]);
        assert_eq!(completion.attempts[0].failure, Some(FailureClass::Blocked));
        assert_eq!(completion.attempts[1].egress, EgressPath::Bypass);

        // Fairness moves the retry onto the untouched credential
        assert_eq!(completion.credential_id, 2);
        assert_eq!(stat(&pool, 1).failure_count, 1);
        assert_eq!(stat(&pool, 1).last_error.as_deref(), Some("Upstream blocked the request: 403 Forbidden"));
        assert_eq!(stat(&pool, 2).success_count, 1);
        assert_eq!(engine.metrics.attempts(EgressPath::Direct, "blocked"), 1);
        assert_eq!(engine.metrics.attempts(EgressPath::Bypass, "success"), 1);
    }

    #[tokio::test]
    async fn test_block_without_bypass_is_terminal() {
        let pool = pool(2);
        let upstream = ScriptedUpstream::new(vec![blocked(), reply(&["never"])]);
        let engine = engine(&pool, &upstream, false, config(5));

        let err = engine.dispatch(&request()).await.unwrap_err();
        match &err {
            DispatchError::Fatal { class, attempts, .. } => {
                assert_eq!(*class, FailureClass::Blocked);
                assert_eq!(attempts.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(upstream.calls().len(), 1);
        assert_eq!(pool.summary().in_use, 0);
    }

    #[tokio::test]
    async fn test_block_on_bypass_is_terminal() {
        let pool = pool(3);
        let upstream = ScriptedUpstream::new(vec![blocked(), blocked(), reply(&["never"])]);
        let engine = engine(&pool, &upstream, true, config(5));

        let err = engine.dispatch(&request()).await.unwrap_err();
        assert_eq!(err.attempts().len(), 2);
        assert_eq!(upstream.egresses(), vec![EgressPath::Direct, EgressPath::Bypass]);
    }

    #[tokio::test]
    async fn test_budget_bounds_upstream_calls() {
        let pool = pool(2);
        let upstream = ScriptedUpstream::new((0..10).map(|_| transient()).collect());
        let engine = engine(&pool, &upstream, true, config(3));

        let err = engine.dispatch(&request()).await.unwrap_err();
        match &err {
            DispatchError::Fatal {
                class,
                message,
                attempts,
            } => {
                assert_eq!(*class, FailureClass::Transient);
                assert!(message.contains("retry budget of 3"));
                assert_eq!(attempts.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(upstream.calls().len(), 3);
        // Transient failures stay on the direct path
        assert!(upstream.egresses().iter().all(|e| *e == EgressPath::Direct));

        let stats = pool.list_stats(None).unwrap();
        let failures: u64 = stats.iter().map(|s| s.failure_count).sum();
        assert_eq!(failures, 3);
        assert!(stats.iter().all(|s| !s.in_use));
    }

    #[tokio::test]
    async fn test_budget_of_one_skips_bypass() {
        let pool = pool(2);
        let upstream = ScriptedUpstream::new(vec![blocked(), reply(&["never"])]);
        let engine = engine(&pool, &upstream, true, config(1));

        let err = engine.dispatch(&request()).await.unwrap_err();
        assert_eq!(err.attempts().len(), 1);
        assert_eq!(upstream.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_surfaces_immediately() {
        let pool = pool(2);
        let upstream = ScriptedUpstream::new(vec![
            Step::Fail(UpstreamError::Fatal("401 Unauthorized".into())),
            reply(&["never"]),
        ]);
        let engine = engine(&pool, &upstream, true, config(4));

        let err = engine.dispatch(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Fatal {
                class: FailureClass::Fatal,
                ..
            }
        ));
        assert_eq!(upstream.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_transient() {
        let pool = pool(1);
        let upstream = ScriptedUpstream::new(vec![Step::Hang, reply(&["late but fine"])]);
        let mut config = config(2);
        config.attempt_timeout = Duration::from_millis(20);
        let engine = engine(&pool, &upstream, false, config);

        let completion = engine.dispatch(&request()).await.unwrap();
        assert_eq!(completion.text, "late but fine");
        assert_eq!(completion.attempts[0].failure, Some(FailureClass::Transient));

        let view = stat(&pool, 1);
        assert_eq!(view.failure_count, 1);
        assert_eq!(view.success_count, 1);
        assert!(!view.in_use);
    }

    #[tokio::test]
    async fn test_mid_body_failure_is_retried_when_buffered() {
        let pool = pool(2);
        let upstream = ScriptedUpstream::new(vec![
            Step::Reply(vec![
                Ok("par".into()),
                Err(UpstreamError::Transient("stream interrupted".into())),
            ]),
            reply(&["full"]),
        ]);
        let engine = engine(&pool, &upstream, false, config(2));

        let completion = engine.dispatch(&request()).await.unwrap();
        assert_eq!(completion.text, "full");
        assert_eq!(completion.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_pool_exhausted_is_not_retried() {
        let pool = pool(0);
        let upstream = ScriptedUpstream::new(vec![reply(&["never"])]);
        let engine = engine(&pool, &upstream, true, config(3));

        let err = engine.dispatch(&request()).await.unwrap_err();
        assert_eq!(err, DispatchError::PoolExhausted { attempts: vec![] });
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn test_retry_with_no_credential_left() {
        let seeds = vec![CredentialSeed::new("cookie_1.txt", "secret-1")];
        let pool = Arc::new(CredentialPool::new(
            seeds,
            PoolConfig::new().with_failure_limit(1),
        ));
        let upstream = ScriptedUpstream::new(vec![blocked(), reply(&["never"])]);
        let engine = engine(&pool, &upstream, true, config(3));

        // The only credential cools down after its failure, so the bypass
        // attempt has nothing to run with
        let err = engine.dispatch(&request()).await.unwrap_err();
        match err {
            DispatchError::PoolExhausted { attempts } => {
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].credential_id, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(upstream.calls().len(), 1);
        assert!(!stat(&pool, 1).in_use);
    }

    #[tokio::test]
    async fn test_reuse_rotation_keeps_credential() {
        let pool = pool(2);
        let upstream = ScriptedUpstream::new(vec![blocked(), reply(&["ok"])]);
        let mut config = config(3);
        config.rotation = CredentialRotation::Reuse;
        let engine = engine(&pool, &upstream, true, config);

        let completion = engine.dispatch(&request()).await.unwrap();
        assert_eq!(completion.credential_id, 1);
        let secrets: Vec<_> = upstream.calls().into_iter().map(|(s, _)| s).collect();
        assert_eq!(secrets, vec!["secret-1".to_string(), "secret-1".to_string()]);
        assert_eq!(stat(&pool, 2).success_count + stat(&pool, 2).failure_count, 0);
    }

    #[tokio::test]
    async fn test_cancelled_dispatch_releases_credential() {
        let pool = pool(1);
        let upstream = ScriptedUpstream::new(vec![Step::Hang]);
        let engine = Arc::new(engine(&pool, &upstream, false, config(2)));

        let task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.dispatch(&request()).await })
        };
        while upstream.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(stat(&pool, 1).in_use);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let view = stat(&pool, 1);
        assert!(!view.in_use);
        assert_eq!(view.failure_count, 1);
        assert_eq!(view.last_error.as_deref(), Some(CANCELLED_ERROR));
    }

    #[tokio::test]
    async fn test_stream_holds_lease_until_end() {
        let pool = pool(1);
        let upstream = ScriptedUpstream::new(vec![reply(&["a", "b"])]);
        let engine = engine(&pool, &upstream, false, config(2));

        let stream = engine.dispatch_stream(&request()).await.unwrap();
        assert_eq!(stream.credential_id, 1);
        assert!(stat(&pool, 1).in_use);
        assert_eq!(pool.acquire().unwrap_err(), PoolError::PoolExhausted);

        let tokens: Vec<_> = stream.tokens.collect().await;
        assert_eq!(tokens, vec![Ok("a".to_string()), Ok("b".to_string())]);

        let view = stat(&pool, 1);
        assert!(!view.in_use);
        assert_eq!(view.success_count, 1);
        assert_eq!(engine.metrics.requests(RequestResult::Success), 1);
        assert_eq!(engine.metrics.requests(RequestResult::Failed), 0);
    }

    #[tokio::test]
    async fn test_stream_failure_ends_with_error() {
        let pool = pool(1);
        let upstream = ScriptedUpstream::new(vec![Step::Reply(vec![
            Ok("partial".into()),
            Err(UpstreamError::Transient("stream interrupted".into())),
            Ok("never seen".into()),
        ])]);
        let engine = engine(&pool, &upstream, false, config(2));

        let stream = engine.dispatch_stream(&request()).await.unwrap();
        let items: Vec<_> = stream.tokens.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok("partial".to_string()));
        assert!(items[1].is_err());

        let view = stat(&pool, 1);
        assert!(!view.in_use);
        assert_eq!(view.failure_count, 1);
        assert_eq!(view.success_count, 0);
        assert_eq!(
            view.last_error.as_deref(),
            Some("Transient upstream failure: stream interrupted")
        );
    }

    #[tokio::test]
    async fn test_stream_idle_timeout() {
        let pool = pool(1);
        let upstream = ScriptedUpstream::new(vec![Step::ReplyThenStall(vec!["a".into()])]);
        let mut config = config(2);
        config.stream_idle_timeout = Duration::from_millis(20);
        let engine = engine(&pool, &upstream, false, config);

        let mut stream = engine.dispatch_stream(&request()).await.unwrap();
        assert_eq!(stream.tokens.next().await, Some(Ok("a".to_string())));
        let stalled = stream.tokens.next().await.unwrap().unwrap_err();
        assert_eq!(stalled.class(), FailureClass::Transient);
        assert!(stream.tokens.next().await.is_none());
        assert!(!stat(&pool, 1).in_use);
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_as_cancelled() {
        let pool = pool(1);
        let upstream = ScriptedUpstream::new(vec![reply(&["a", "b", "c"])]);
        let engine = engine(&pool, &upstream, false, config(2));

        let mut stream = engine.dispatch_stream(&request()).await.unwrap();
        assert_eq!(stream.tokens.next().await, Some(Ok("a".to_string())));
        drop(stream);

        let view = stat(&pool, 1);
        assert!(!view.in_use);
        assert_eq!(view.last_error.as_deref(), Some(CANCELLED_ERROR));
        assert_eq!(engine.metrics.requests(RequestResult::Failed), 1);
        assert_eq!(engine.metrics.requests(RequestResult::Success), 0);
    }

    #[tokio::test]
    async fn test_unpolled_stream_counts_as_failed() {
        let pool = pool(1);
        let upstream = ScriptedUpstream::new(vec![reply(&["a"])]);
        let engine = engine(&pool, &upstream, false, config(2));

        drop(engine.dispatch_stream(&request()).await.unwrap());

        assert!(!stat(&pool, 1).in_use);
        assert_eq!(engine.metrics.requests(RequestResult::Failed), 1);
    }

    #[tokio::test]
    async fn test_stream_retries_before_accept() {
        let pool = pool(2);
        let upstream = ScriptedUpstream::new(vec![blocked(), reply(&["ok"])]);
        let engine = engine(&pool, &upstream, true, config(2));

        let stream = engine.dispatch_stream(&request()).await.unwrap();
        assert_eq!(stream.attempts.len(), 2);
        assert_eq!(stream.attempts[1].egress, EgressPath::Bypass);
        let text: Vec<_> = stream.tokens.collect().await;
        assert_eq!(text, vec![Ok("ok".to_string())]);
    }

    /// Upstream that fails the test if two calls ever share a secret
    #[derive(Default)]
    struct ExclusiveUpstream {
        in_flight: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl Upstream for ExclusiveUpstream {
        async fn open(
            &self,
            _request: &UpstreamRequest,
            secret: &str,
            _egress: EgressPath,
        ) -> Result<TokenStream, UpstreamError> {
            assert!(
                self.in_flight.lock().unwrap().insert(secret.to_string()),
                "{secret} used by two attempts at once"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.in_flight.lock().unwrap().remove(secret);
            Ok(Box::pin(stream::iter(vec![Ok("x".to_string())])))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dispatch_never_shares_credentials() {
        let pool = pool(3);
        let engine = Arc::new(DispatchEngine::new(
            Arc::clone(&pool),
            Arc::new(ExclusiveUpstream::default()),
            EgressSelector::new(false),
            config(1),
            GatewayMetrics::new().unwrap(),
        ));

        let tasks: Vec<_> = (0..24)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.dispatch(&request()).await })
            })
            .collect();

        let mut succeeded = 0u64;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(DispatchError::PoolExhausted { .. }) => {}
                Err(other) => panic!("unexpected {other:?}"),
            }
        }

        assert!(succeeded >= 3);
        let stats = pool.list_stats(None).unwrap();
        assert_eq!(stats.iter().map(|s| s.success_count).sum::<u64>(), succeeded);
        assert_eq!(pool.summary().in_use, 0);
    }
}
