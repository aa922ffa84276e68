//! Stats/admin surface
//!
//! Capability-gated view over the credential pool. Viewers see redacted
//! snapshots; admins see secrets and may update a credential. Updates apply in
//! memory first and are then written back to the credential store when one is
//! configured.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use super::credential_pool::{
    CredentialId, CredentialPool, CredentialStatView, CredentialUpdate, PoolError,
};
use super::credential_store::CredentialStore;

/// What the caller of the admin surface is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Capability {
    None,
    Viewer,
    Admin,
}

impl Capability {
    pub fn can_view(self) -> bool {
        self >= Capability::Viewer
    }

    pub fn can_admin(self) -> bool {
        self == Capability::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Admin capability required")]
    Forbidden,

    #[error("Credential {0} not found")]
    NotFound(CredentialId),

    #[error("Invalid update: {0}")]
    Invalid(String),
}

impl From<PoolError> for AdminError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NotFound(id) => AdminError::NotFound(id),
            // Stats and updates never acquire
            PoolError::PoolExhausted => AdminError::Invalid(err.to_string()),
        }
    }
}

/// Result of an admin update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateReport {
    pub credential: CredentialStatView,
    /// Whether the change reached the credential store
    pub persisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_error: Option<String>,
}

pub struct AdminSurface {
    pool: Arc<CredentialPool>,
    store: Option<CredentialStore>,
}

impl AdminSurface {
    /// `store` is where updates are written back; `None` keeps them in memory
    pub fn new(pool: Arc<CredentialPool>, store: Option<CredentialStore>) -> Self {
        Self { pool, store }
    }

    pub fn list(
        &self,
        capability: Capability,
        filter: Option<CredentialId>,
    ) -> Result<Vec<CredentialStatView>, AdminError> {
        if !capability.can_view() {
            return Err(AdminError::Unauthenticated);
        }

        let views = self.pool.list_stats(filter)?;
        if capability.can_admin() {
            Ok(views)
        } else {
            Ok(views.into_iter().map(CredentialStatView::redacted).collect())
        }
    }

    pub async fn update(
        &self,
        capability: Capability,
        id: CredentialId,
        mut update: CredentialUpdate,
    ) -> Result<UpdateReport, AdminError> {
        match capability {
            Capability::None => return Err(AdminError::Unauthenticated),
            Capability::Viewer => return Err(AdminError::Forbidden),
            Capability::Admin => {}
        }

        if let Some(secret) = update.secret.as_mut() {
            let trimmed = secret.trim();
            if trimmed.is_empty() {
                return Err(AdminError::Invalid("secret must not be empty".into()));
            }
            *secret = trimmed.to_string();
        }
        if update.is_empty() {
            return Err(AdminError::Invalid("nothing to update".into()));
        }

        let credential = self.pool.update_credential(id, update.clone())?;

        let (persisted, persist_error) = match &self.store {
            Some(store) => match persist(store, &credential.source, &update).await {
                Ok(()) => (true, None),
                Err(error) => {
                    tracing::warn!(
                        credential_id = id,
                        error = %error,
                        "Credential updated in memory but not written back"
                    );
                    (false, Some(error))
                }
            },
            None => (false, None),
        };

        tracing::info!(
            credential_id = id,
            secret_updated = update.secret.is_some(),
            enabled = ?update.enabled,
            persisted,
            "Admin updated credential"
        );

        Ok(UpdateReport {
            credential,
            persisted,
            persist_error,
        })
    }
}

async fn persist(
    store: &CredentialStore,
    source: &str,
    update: &CredentialUpdate,
) -> Result<(), String> {
    if let Some(secret) = &update.secret {
        store
            .persist_secret(source, secret)
            .await
            .map_err(|e| e.to_string())?;
    }
    if let Some(enabled) = update.enabled {
        store
            .persist_enabled(source, enabled)
            .await
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}
