//! Remote Embedding Backend
//!
//! Calls an OpenAI-compatible `/embeddings` endpoint. Only consulted when an
//! API key is configured; network and API failures disable the backend for
//! the rest of the process (until key rotation re-enables it).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Embedding, EmbeddingError, EMBEDDING_DIMENSIONS};

/// Model requested from the remote API
pub const MODEL_ID: &str = "text-embedding-3-small@384";

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/embeddings";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Remote API backend
pub struct RemoteBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteBackend {
    pub fn new() -> Self {
        Self::with_endpoint(
            std::env::var("TROVE_EMBEDDINGS_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string()),
        )
    }

    pub fn with_endpoint(endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, endpoint }
    }

    /// Embed a batch of texts through the remote API
    pub async fn embed_batch(
        &self,
        texts: &[&str],
        api_key: &str,
    ) -> Result<Vec<Embedding>, EmbeddingError> {
        let model = MODEL_ID.split('@').next().unwrap_or(MODEL_ID);
        let request = EmbeddingsRequest {
            model,
            input: texts,
            dimensions: EMBEDDING_DIMENSIONS,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbeddingError::EmbeddingFailed(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "embedding API returned {}",
                response.status()
            )));
        }

        let mut body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::EmbeddingFailed(format!("malformed response: {}", e)))?;

        if body.data.len() != texts.len() {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.data.len()
            )));
        }

        // The API documents data[] as index-ordered; sort anyway
        body.data.sort_by_key(|d| d.index);

        Ok(body
            .data
            .into_iter()
            .map(|d| Embedding::new(d.embedding, MODEL_ID))
            .collect())
    }
}

impl Default for RemoteBackend {
    fn default() -> Self {
        Self::new()
    }
}
