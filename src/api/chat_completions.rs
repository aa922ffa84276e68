//! OpenAI Chat Completions API endpoint
//!
//! POST /v1/chat/completions. The request is flattened into the upstream's
//! prompt shape and handed to the dispatch engine once; the engine's result is
//! framed back as a `chat.completion` object or as `chat.completion.chunk`
//! server-sent events.

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    Json,
};
use futures::StreamExt;
use std::convert::Infallible;
use validator::Validate;

use crate::error::ApiError;
use crate::schemas::openai::{
    current_timestamp, generate_completion_id, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, OpenAIErrorResponse,
};
use crate::server::state::AppState;
use crate::services::upstream::wire::{is_supported_model, SUPPORTED_MODELS};
use crate::services::{CompletionStream, PromptMessage, UpstreamError, UpstreamRequest};

/// Marker ending every successful stream
const DONE_MARKER: &str = "[DONE]";

/// POST /v1/chat/completions - Create a chat completion
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    request.validate()?;
    if !is_supported_model(&request.model) {
        return Err(ApiError::InvalidRequest(format!(
            "Model '{}' is not supported. Available models: {}",
            request.model,
            SUPPORTED_MODELS.join(", ")
        )));
    }

    let upstream_request = to_upstream_request(&request);
    tracing::info!(
        model = %request.model,
        messages = request.messages.len(),
        stream = request.stream,
        "Chat completion request"
    );

    if request.stream {
        let completion = state.dispatch.dispatch_stream(&upstream_request).await?;
        return Ok(stream_response(completion, request.model).into_response());
    }

    let completion = state.dispatch.dispatch(&upstream_request).await?;
    tracing::debug!(
        credential_id = completion.credential_id,
        attempts = completion.attempts.len(),
        chars = completion.text.chars().count(),
        "Chat completion finished"
    );
    Ok(Json(ChatCompletionResponse::new(&request.model, completion.text)).into_response())
}

fn to_upstream_request(request: &ChatCompletionRequest) -> UpstreamRequest {
    UpstreamRequest {
        model: request.model.clone(),
        messages: request
            .messages
            .iter()
            .map(|m| PromptMessage::new(m.role.as_str(), m.text()))
            .collect(),
    }
}

fn stream_response(
    completion: CompletionStream,
    model: String,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let CompletionStream {
        credential_id,
        mut tokens,
        ..
    } = completion;
    let id = generate_completion_id();
    let created = current_timestamp();

    let events = async_stream::stream! {
        tracing::debug!(completion_id = %id, credential_id, "Starting SSE stream");
        yield Ok(chunk_event(&ChatCompletionChunk::role(&id, &model, created)));

        while let Some(item) = tokens.next().await {
            match item {
                Ok(text) => {
                    if !text.is_empty() {
                        yield Ok(chunk_event(&ChatCompletionChunk::content(&id, &model, created, text)));
                    }
                }
                Err(error) => {
                    yield Ok(error_event(&error));
                    return;
                }
            }
        }

        yield Ok(chunk_event(&ChatCompletionChunk::stop(&id, &model, created)));
        yield Ok(Event::default().data(DONE_MARKER));
    };

    Sse::new(events).keep_alive(KeepAlive::default())
}

fn chunk_event(chunk: &ChatCompletionChunk) -> Event {
    Event::default().data(serde_json::to_string(chunk).unwrap_or_default())
}

/// Explicit terminal event for a stream that failed after it started
fn error_event(error: &UpstreamError) -> Event {
    let body = OpenAIErrorResponse::with_code("server_error", &error.to_string(), "stream_interrupted");
    Event::default()
        .event("error")
        .data(serde_json::to_string(&body).unwrap_or_default())
}
