//! Upstream wire format
//!
//! Request payloads for the upstream web chat endpoints and the decoder for
//! its newline-delimited JSON token stream.

use serde::{Deserialize, Serialize};

use super::PromptMessage;

// ============================================================================
// Constants
// ============================================================================

pub const GROK3_MODEL: &str = "grok-3";
pub const GROK3_REASONING_MODEL: &str = "grok-3-reasoning";

/// Model names accepted on the chat endpoint
pub const SUPPORTED_MODELS: [&str; 2] = [GROK3_MODEL, GROK3_REASONING_MODEL];

pub const NEW_CHAT_PATH: &str = "/rest/app-chat/conversations/new";
pub const UPLOAD_FILE_PATH: &str = "/rest/app-chat/upload-file";

/// Replaces the prompt when it is sent as an attachment
pub const UPLOAD_MESSAGE_PROMPT: &str = "Follow the instructions in the attached file to respond.";

/// Browser-like headers the upstream web app expects
pub const DEFAULT_HEADERS: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("accept-language", "en-GB,en;q=0.9"),
    ("content-type", "application/json"),
    ("origin", "https://grok.com"),
    ("priority", "u=1, i"),
    ("referer", "https://grok.com/"),
    (
        "sec-ch-ua",
        "\"Not/A)Brand\";v=\"8\", \"Chromium\";v=\"126\", \"Brave\";v=\"126\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"macOS\""),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-origin"),
    ("sec-gpc", "1"),
    (
        "user-agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36 Edg/134.0.0.0",
    ),
];

pub fn is_supported_model(model: &str) -> bool {
    SUPPORTED_MODELS.contains(&model)
}

/// Flatten a conversation into the single prompt the upstream accepts
pub fn build_prompt(before: &str, after: &str, messages: &[PromptMessage]) -> String {
    let mut prompt = format!("{before}\n");
    for message in messages {
        prompt.push_str("\n[[");
        prompt.push_str(&message.role);
        prompt.push_str("]]\n");
        prompt.push_str(&message.content);
    }
    prompt.push('\n');
    prompt.push_str(after);
    prompt
}

// ============================================================================
// Request Payloads
// ============================================================================

/// Built-in upstream tools, all switched off
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverrides {
    pub image_gen: bool,
    pub trends_search: bool,
    pub web_search: bool,
    pub x_media_search: bool,
    pub x_post_analyze: bool,
    pub x_search: bool,
}

/// Body of a new-conversation request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub disable_search: bool,
    pub enable_image_generation: bool,
    pub enable_image_streaming: bool,
    pub enable_side_by_side: bool,
    pub file_attachments: Vec<String>,
    pub force_concise: bool,
    pub image_attachments: Vec<String>,
    pub image_generation_count: u32,
    pub is_preset: bool,
    pub is_reasoning: bool,
    pub message: String,
    pub model_name: String,
    pub return_image_bytes: bool,
    pub return_raw_grok_in_xai_request: bool,
    pub send_final_metadata: bool,
    /// Temporary conversations stay out of the account history
    pub temporary: bool,
    pub tool_overrides: ToolOverrides,
    pub webpage_urls: Vec<String>,
}

impl ChatPayload {
    pub fn new(message: String, model: &str, keep_chat: bool) -> Self {
        Self {
            disable_search: false,
            enable_image_generation: true,
            enable_image_streaming: true,
            enable_side_by_side: true,
            file_attachments: Vec::new(),
            force_concise: false,
            image_attachments: Vec::new(),
            image_generation_count: 2,
            is_preset: false,
            is_reasoning: model == GROK3_REASONING_MODEL,
            message,
            model_name: GROK3_MODEL.to_string(),
            return_image_bytes: false,
            return_raw_grok_in_xai_request: false,
            send_final_metadata: true,
            temporary: !keep_chat,
            tool_overrides: ToolOverrides::default(),
            webpage_urls: Vec::new(),
        }
    }

    /// Point the request at an uploaded prompt file
    pub fn attach(&mut self, file_metadata_id: String) {
        self.file_attachments = vec![file_metadata_id];
        self.message = UPLOAD_MESSAGE_PROMPT.to_string();
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileRequest {
    /// Base64-encoded file content
    pub content: String,
    pub file_mime_type: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileResponse {
    pub file_metadata_id: String,
}

// ============================================================================
// Token Stream
// ============================================================================

#[derive(Debug, Deserialize)]
struct ResponseToken {
    result: Option<ResponseResult>,
}

#[derive(Debug, Deserialize)]
struct ResponseResult {
    response: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseContent {
    token: Option<String>,
    is_thinking: Option<bool>,
}

/// Turns upstream NDJSON lines into response text.
///
/// Reasoning tokens are wrapped in a single `<think>` block, or dropped when
/// `ignore_thinking` is set.
#[derive(Debug, Clone, Default)]
pub struct TokenDecoder {
    ignore_thinking: bool,
    in_thinking: bool,
}

impl TokenDecoder {
    pub fn new(ignore_thinking: bool) -> Self {
        Self {
            ignore_thinking,
            in_thinking: false,
        }
    }

    /// Decode one line; metadata lines and unparseable lines yield nothing
    pub fn decode_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let parsed: ResponseToken = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparseable upstream line");
                return None;
            }
        };

        let content = parsed.result?.response?;
        let token = content.token?;
        self.frame(token, content.is_thinking.unwrap_or(false))
    }

    /// Close an open `<think>` block at end of stream
    pub fn finish(&mut self) -> Option<String> {
        if self.in_thinking {
            self.in_thinking = false;
            Some("\n</think>\n\n".to_string())
        } else {
            None
        }
    }

    fn frame(&mut self, token: String, thinking: bool) -> Option<String> {
        if thinking {
            if self.ignore_thinking {
                return None;
            }
            if !self.in_thinking {
                self.in_thinking = true;
                return Some(format!("<think>\n{token}"));
            }
            return (!token.is_empty()).then_some(token);
        }

        if self.in_thinking {
            self.in_thinking = false;
            return Some(format!("\n</think>\n\n{token}"));
        }
        (!token.is_empty()).then_some(token)
    }
}

/// Splits a byte stream into lines without breaking multi-byte characters
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }

    /// Whatever trailed the last newline
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
