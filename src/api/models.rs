//! OpenAI Models API endpoint
//!
//! GET /v1/models and GET /v1/models/{model_id}.

use axum::{extract::Path, Json};

use crate::error::ApiError;
use crate::schemas::openai::{current_timestamp, Model, ModelsResponse};
use crate::services::upstream::wire::SUPPORTED_MODELS;

const MODEL_OWNER: &str = "xai";

fn model(id: &str, created: i64) -> Model {
    Model {
        id: id.to_string(),
        object: "model".to_string(),
        created,
        owned_by: MODEL_OWNER.to_string(),
    }
}

/// GET /v1/models - List available models
pub async fn list_models() -> Json<ModelsResponse> {
    let created = current_timestamp();
    Json(ModelsResponse {
        object: "list".to_string(),
        data: SUPPORTED_MODELS.iter().map(|id| model(id, created)).collect(),
    })
}

/// GET /v1/models/{model_id} - Retrieve one model
pub async fn get_model(Path(model_id): Path<String>) -> Result<Json<Model>, ApiError> {
    SUPPORTED_MODELS
        .iter()
        .find(|id| **id == model_id)
        .map(|id| Json(model(id, current_timestamp())))
        .ok_or_else(|| ApiError::NotFound(format!("Model '{model_id}' not found")))
}
