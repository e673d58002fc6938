//! LLM collaborator abstraction.
//!
//! Defines the [`ChatModel`] trait used by the planner and the reasoning
//! tool, the shared request/response types, and strict response parsing.
//! The model is a black box: its output is validated and may be discarded
//! in favor of a deterministic fallback.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub mod embedder;
pub mod openai;

pub use embedder::{Embedder, EmbedderError, HttpEmbedder};
pub use openai::OpenAiChatModel;

/// A single-turn completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// System prompt, injected before the user message.
    pub system: Option<String>,
    /// User message body.
    pub user: String,
    /// Maximum completion tokens.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
}

/// A completion response with usage counters.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Raw text content of the first choice.
    pub content: String,
    /// Prompt tokens consumed.
    pub prompt_tokens: u64,
    /// Completion tokens produced.
    pub completion_tokens: u64,
    /// Model identifier that served the response.
    pub model: String,
}

/// Errors returned by chat model collaborators.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP transport failure.
    #[error("llm request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Upstream responded with a non-success status.
    #[error("llm returned status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
    /// Response did not match the expected schema.
    #[error("llm response parse error: {0}")]
    Parse(String),
    /// The call exceeded its deadline.
    #[error("llm call timed out")]
    Timeout,
    /// The collaborator is disabled or misconfigured.
    #[error("llm unavailable: {0}")]
    Unavailable(String),
}

/// Chat completion interface.
///
/// Implementations must be `Send + Sync` so they can be shared across
/// concurrently running investigations.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Produce a completion for the request.
    ///
    /// # Errors
    ///
    /// Returns an error when the provider is unreachable, responds with a
    /// non-success status after retries, or the response cannot be parsed.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// The configured model identifier.
    fn model_id(&self) -> &str;
}

/// Parse a JSON object of type `T` out of a model response.
///
/// Tries a direct parse, then a Markdown code fence, then the outermost
/// brace-delimited span. Anything else is a parse error — free-form prose
/// around the object is tolerated, alternative formats are not.
pub fn parse_json_response<T: DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Ok(value);
    }

    if let Some(block) = extract_fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<T>(block) {
            return Ok(value);
        }
    }

    if let Some(span) = outermost_object_span(trimmed) {
        if let Ok(value) = serde_json::from_str::<T>(span) {
            return Ok(value);
        }
    }

    Err(LlmError::Parse(format!(
        "could not parse JSON from response: {}",
        crate::redaction::truncate_on_boundary(trimmed, 200)
    )))
}

/// Extract the content of a Markdown code fence.
///
/// Supports ```` ```json ```` and bare ```` ``` ```` fences.
fn extract_fenced_block(text: &str) -> Option<&str> {
    let start_marker_json = "```json";
    let start_marker_plain = "```";
    let end_marker = "```";

    let content_start = if let Some(pos) = text.find(start_marker_json) {
        pos.checked_add(start_marker_json.len())?
    } else if let Some(pos) = text.find(start_marker_plain) {
        pos.checked_add(start_marker_plain.len())?
    } else {
        return None;
    };

    let rest = text.get(content_start..)?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end_pos = rest.find(end_marker)?;
    Some(rest.get(..end_pos)?.trim())
}

/// Slice from the first `{` to the last `}`, when both exist.
fn outermost_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    text.get(start..=end)
}
