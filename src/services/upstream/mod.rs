//! Upstream chat service
//!
//! The `Upstream` trait is the seam between the dispatch engine and the
//! network: one call opens one completion with one credential over one
//! egress path. `HttpUpstream` is the production implementation.

mod client;
pub mod wire;

pub use client::{classify_status, HttpUpstream};

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

use super::egress::{EgressPath, FailureClass};

/// One message of the conversation sent upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Logical request as seen by the core: model plus conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Vec<PromptMessage>,
}

/// Response text, token by token
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, UpstreamError>> + Send>>;

/// Classified upstream failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("Upstream blocked the request: {0}")]
    Blocked(String),

    #[error("Transient upstream failure: {0}")]
    Transient(String),

    #[error("Upstream rejected the request: {0}")]
    Fatal(String),
}

impl UpstreamError {
    pub fn class(&self) -> FailureClass {
        match self {
            UpstreamError::Blocked(_) => FailureClass::Blocked,
            UpstreamError::Transient(_) => FailureClass::Transient,
            UpstreamError::Fatal(_) => FailureClass::Fatal,
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        UpstreamError::Transient(format!("timed out after {after:?}"))
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Open a completion. `Ok` means the upstream accepted the request; the
    /// returned stream may still fail part way through.
    async fn open(
        &self,
        request: &UpstreamRequest,
        secret: &str,
        egress: EgressPath,
    ) -> Result<TokenStream, UpstreamError>;
}
