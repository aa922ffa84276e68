//! Application state container
//!
//! Shared resources handed to every request handler through axum's state
//! extraction.

use anyhow::Context;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::services::{
    AdminSurface, CredentialPool, CredentialSeed, CredentialStore, DispatchEngine, EgressSelector,
    GatewayMetrics, HttpUpstream, Upstream,
};

/// TCP connect deadline of the upstream clients
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared application state
///
/// Cheaply cloneable; every field is behind an `Arc` or is itself a handle.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,

    pub pool: Arc<CredentialPool>,

    pub dispatch: Arc<DispatchEngine>,

    pub admin: Arc<AdminSurface>,

    pub metrics: GatewayMetrics,

    /// Application start time (for uptime calculation)
    pub start_time: Instant,
}

impl AppState {
    /// Load credentials from the configured directory and build the HTTP
    /// upstream client
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let store = CredentialStore::new(settings.credentials_dir.clone());
        let seeds = store
            .load()
            .await
            .with_context(|| format!("Failed to load credentials from {}", store.dir().display()))?;

        tracing::debug!("Creating upstream client");
        let upstream = HttpUpstream::new(
            settings.upstream.clone(),
            &settings.egress,
            UPSTREAM_CONNECT_TIMEOUT,
        )
        .context("Failed to build upstream HTTP client")?;

        let store = settings.persist_admin_updates.then_some(store);
        Self::with_upstream(settings, seeds, Arc::new(upstream), store)
    }

    /// Assemble the state around an already built upstream
    pub fn with_upstream(
        settings: Settings,
        seeds: Vec<CredentialSeed>,
        upstream: Arc<dyn Upstream>,
        store: Option<CredentialStore>,
    ) -> anyhow::Result<Self> {
        let metrics = GatewayMetrics::new().context("Failed to register metrics")?;
        let pool = Arc::new(CredentialPool::new(seeds, settings.pool_config()));
        if pool.is_empty() {
            tracing::warn!("Credential pool is empty; chat requests will fail until credentials are added");
        }

        let dispatch = Arc::new(DispatchEngine::new(
            Arc::clone(&pool),
            upstream,
            EgressSelector::new(settings.egress.bypass_available()),
            settings.dispatch_config(),
            metrics.clone(),
        ));
        let admin = Arc::new(AdminSurface::new(Arc::clone(&pool), store));

        tracing::info!(
            credentials = pool.len(),
            bypass_available = settings.egress.bypass_available(),
            "Application state initialized"
        );

        Ok(Self {
            settings: Arc::new(settings),
            pool,
            dispatch,
            admin,
            metrics,
            start_time: Instant::now(),
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
