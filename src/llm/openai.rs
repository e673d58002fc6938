//! OpenAI-compatible chat completion client.
//!
//! Talks to any endpoint implementing the `/v1/chat/completions` wire
//! format. Transport failures and 5xx responses are retried with
//! exponential backoff; 4xx responses are terminal.

use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};

use super::{ChatModel, ChatRequest, ChatResponse, LlmError};

/// Retry attempts for transient failures.
const MAX_ATTEMPTS: u32 = 3;

/// Initial backoff between attempts, in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 200;

/// OpenAI-compatible chat completion provider.
pub struct OpenAiChatModel {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiChatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatModel")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiChatModel {
    /// Create a provider with a request-level timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.to_owned(),
            model: model.to_owned(),
            client,
        })
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.user }));
        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        })
    }

    async fn send_once(&self, body: &Value) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::HttpStatus {
                status: status.as_u16(),
                body: crate::redaction::truncate_on_boundary(&text, 500).to_owned(),
            });
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| LlmError::Parse(e.to_string()))?;
        let content = parsed["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .ok_or_else(|| LlmError::Parse("missing choices[0].message.content".to_owned()))?
            .to_owned();
        let prompt_tokens = parsed["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        let completion_tokens = parsed["usage"]["completion_tokens"].as_u64().unwrap_or(0);
        let model = parsed["model"]
            .as_str()
            .unwrap_or(self.model.as_str())
            .to_owned();

        Ok(ChatResponse {
            content,
            prompt_tokens,
            completion_tokens,
            model,
        })
    }
}

#[async_trait::async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let body = self.build_body(request);
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut last_error = LlmError::Unavailable("no attempt made".to_owned());

        for attempt in 1..=MAX_ATTEMPTS {
            match self.send_once(&body).await {
                Ok(response) => return Ok(response),
                Err(e) if is_retryable(&e) && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(attempt, error = %e, "llm call failed, retrying");
                    let jitter: u64 = rand::thread_rng().gen_range(0..100);
                    tokio::time::sleep(Duration::from_millis(backoff_ms.saturating_add(jitter)))
                        .await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Whether an error is worth another attempt.
fn is_retryable(error: &LlmError) -> bool {
    match error {
        LlmError::Request(_) => true,
        LlmError::HttpStatus { status, .. } => *status >= 500,
        _ => false,
    }
}
