//! OpenAI API schema definitions
//!
//! Request and response types of the OpenAI Chat Completions API, limited to
//! what a text-only upstream can honour. Unknown request fields are ignored.

use serde::{Deserialize, Serialize};
use validator::Validate;

// ============================================================================
// Request Types
// ============================================================================

/// OpenAI Chat Completion Request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChatCompletionRequest {
    /// Model ID (e.g., "grok-3", "grok-3-reasoning")
    #[validate(length(min = 1, message = "model must not be empty"))]
    pub model: String,

    /// Messages in the conversation
    #[validate(length(min = 1, message = "messages must contain at least one message"))]
    pub messages: Vec<ChatMessage>,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,

    /// Accepted for compatibility; sampling is decided upstream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::Developer => "developer",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,

    /// Message content (string or array of content parts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::to_string_content)
            .unwrap_or_default()
    }
}

/// Message content - can be string or array of content parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Convert to string, joining text parts with newlines
    pub fn to_string_content(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Other => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Content part; anything but text is dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },

    #[serde(other)]
    Other,
}

// ============================================================================
// Response Types
// ============================================================================

/// Chat completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,

    /// Always "chat.completion"
    pub object: String,

    /// Unix timestamp of creation
    pub created: i64,

    pub model: String,

    pub choices: Vec<Choice>,

    /// Token counts; the upstream does not report them
    pub usage: CompletionUsage,
}

impl ChatCompletionResponse {
    pub fn new(model: &str, content: String) -> Self {
        Self {
            id: generate_completion_id(),
            object: "chat.completion".to_string(),
            created: current_timestamp(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: ChatRole::Assistant,
                    content: Some(content),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: CompletionUsage::default(),
        }
    }
}

/// Completion choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: i32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

/// Assistant message in response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: ChatRole,
    pub content: Option<String>,
}

/// Token usage statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
}

// ============================================================================
// Streaming Types
// ============================================================================

/// Streaming chunk response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,

    /// Always "chat.completion.chunk"
    pub object: String,

    pub created: i64,

    pub model: String,

    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    fn with_delta(id: &str, model: &str, created: i64, delta: ChunkDelta, finish: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish.map(str::to_string),
            }],
        }
    }

    /// First chunk, announcing the assistant role
    pub fn role(id: &str, model: &str, created: i64) -> Self {
        let delta = ChunkDelta {
            role: Some(ChatRole::Assistant),
            content: None,
        };
        Self::with_delta(id, model, created, delta, None)
    }

    pub fn content(id: &str, model: &str, created: i64, text: String) -> Self {
        let delta = ChunkDelta {
            role: None,
            content: Some(text),
        };
        Self::with_delta(id, model, created, delta, None)
    }

    /// Last chunk before `[DONE]`
    pub fn stop(id: &str, model: &str, created: i64) -> Self {
        Self::with_delta(id, model, created, ChunkDelta::default(), Some("stop"))
    }
}

/// Streaming choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: i32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

/// Delta content in streaming
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Role (only in first chunk)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ChatRole>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

// ============================================================================
// Models API Types
// ============================================================================

/// List models response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    /// Always "list"
    pub object: String,
    pub data: Vec<Model>,
}

/// Model information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,

    /// Always "model"
    pub object: String,

    pub created: i64,

    pub owned_by: String,
}

// ============================================================================
// Error Types
// ============================================================================

/// OpenAI-style error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIErrorResponse {
    pub error: OpenAIError,
}

/// OpenAI error details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIError {
    pub message: String,

    #[serde(rename = "type")]
    pub error_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl OpenAIErrorResponse {
    pub fn new(error_type: &str, message: &str) -> Self {
        Self {
            error: OpenAIError {
                message: message.to_string(),
                error_type: error_type.to_string(),
                param: None,
                code: None,
            },
        }
    }

    pub fn with_code(error_type: &str, message: &str, code: &str) -> Self {
        let mut response = Self::new(error_type, message);
        response.error.code = Some(code.to_string());
        response
    }

    pub fn invalid_request(message: &str) -> Self {
        Self::new("invalid_request_error", message)
    }

    pub fn authentication_error(message: &str) -> Self {
        Self::new("authentication_error", message)
    }

    pub fn server_error(message: &str) -> Self {
        Self::new("server_error", message)
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Generate a unique completion ID
pub fn generate_completion_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("chatcmpl-{}", &uuid[..24])
}

/// Get current Unix timestamp
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============================================================================
// Tests
// ============================================================================
