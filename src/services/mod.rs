//! Services module
//!
//! Credential pooling, egress selection, upstream dispatch and the admin
//! surface built on top of them.

pub mod admin;
pub mod credential_pool;
pub mod credential_store;
pub mod dispatch;
pub mod egress;
pub mod metrics;
pub mod upstream;

pub use admin::{AdminError, AdminSurface, Capability, UpdateReport};
pub use credential_pool::{
    AttemptOutcome, CredentialId, CredentialLease, CredentialPool, CredentialSeed,
    CredentialStatView, CredentialUpdate, PoolConfig, PoolError, PoolStats,
};
pub use credential_store::{CredentialStore, StoreError};
pub use dispatch::{
    Attempt, Completion, CompletionStream, CredentialRotation, DispatchConfig, DispatchEngine,
    DispatchError,
};
pub use egress::{EgressPath, EgressSelector, FailureClass};
pub use metrics::{GatewayMetrics, RequestResult};
pub use upstream::{HttpUpstream, PromptMessage, TokenStream, Upstream, UpstreamError, UpstreamRequest};
