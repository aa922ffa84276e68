//! Admin surface request and response bodies

use serde::{Deserialize, Serialize};

use crate::services::{CredentialId, CredentialStatView, CredentialUpdate};

/// Body of `POST /api/credentials/:id`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateCredentialRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl From<UpdateCredentialRequest> for CredentialUpdate {
    fn from(request: UpdateCredentialRequest) -> Self {
        CredentialUpdate {
            secret: request.secret,
            enabled: request.enabled,
        }
    }
}

/// Query of `GET /api/credentials`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialFilter {
    pub id: Option<CredentialId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialListResponse {
    pub total: usize,
    pub credentials: Vec<CredentialStatView>,
}
