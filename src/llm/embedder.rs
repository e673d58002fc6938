//! Embedding generation trait and HTTP implementation.
//!
//! The [`Embedder`] trait abstracts over embedding providers. The default
//! implementation [`HttpEmbedder`] calls an OpenAI-compatible
//! `/v1/embeddings` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Core embedding generation interface.
///
/// All implementations must be `Send + Sync` to allow shared use across
/// async task boundaries.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding vector for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding provider is unreachable or the
    /// request fails.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    /// Returns the dimensionality of the embedding vectors produced.
    fn dimensions(&self) -> usize;
}

/// Errors from embedding generation.
#[derive(Debug, thiserror::Error)]
pub enum EmbedderError {
    /// HTTP transport failure.
    #[error("embedder request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Response did not match expected format.
    #[error("embedder response parse error: {0}")]
    Parse(String),

    /// Provider is unavailable.
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
}

/// OpenAI-compatible embedder using the `/v1/embeddings` endpoint.
pub struct HttpEmbedder {
    model: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    dims: usize,
}

impl std::fmt::Debug for HttpEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbedder")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("dims", &self.dims)
            .finish_non_exhaustive()
    }
}

impl HttpEmbedder {
    /// Create an embedder for the given model.
    ///
    /// `dims` is the expected dimensionality of embeddings and must match
    /// the vector column in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        dims: usize,
        timeout: Duration,
    ) -> Result<Self, EmbedderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            model: model.to_owned(),
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.to_owned(),
            dims,
        })
    }

    fn build_request(&self, text: &str) -> EmbedRequest {
        EmbedRequest {
            model: self.model.clone(),
            input: text.to_owned(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = self.build_request(text);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(EmbedderError::Unavailable(format!(
                "embedding endpoint returned {status}: {body_text}"
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbedderError::Parse(e.to_string()))?;

        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbedderError::Parse("empty data array".to_owned()))?;

        if embedding.len() != self.dims {
            return Err(EmbedderError::Parse(format!(
                "expected {} dimensions, got {}",
                self.dims,
                embedding.len()
            )));
        }

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Debug, Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}
