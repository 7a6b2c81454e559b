//! HTTP client for the embedding service.
//!
//! Endpoints:
//! - `POST /encode` `{"text": ...}` -> `{"embedding": [...], "processing_time": secs}`
//! - `POST /encode_batch` `{"texts": [...]}` -> `{"embeddings": [[...]], "count": n}`
//! - `GET /health` -> `{"status", "model", "vector_size", "device", "total_requests"}`
//!
//! The client makes a single attempt per call; retry policy belongs to
//! the caller.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use docsync_types::EmbeddingSettings;

use crate::error::EmbeddingError;
use crate::provider::{Embedding, EmbeddingProvider, ProviderHealth};

#[derive(Serialize)]
struct EncodeRequest<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct EncodeBatchRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EncodeResponse {
    embedding: Vec<f32>,
    #[serde(default)]
    processing_time: Option<f64>,
}

impl From<EncodeResponse> for Embedding {
    fn from(response: EncodeResponse) -> Self {
        Embedding {
            values: response.embedding,
            processing_time: response
                .processing_time
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EncodeBatchResponse {
    embeddings: Vec<Vec<f32>>,
    count: usize,
}

impl EncodeBatchResponse {
    fn into_embeddings(self, expected: usize) -> Result<Vec<Embedding>, EmbeddingError> {
        if self.count != self.embeddings.len() || self.count != expected {
            return Err(EmbeddingError::InvalidResponse(format!(
                "service returned {} embeddings (count {}) for {} inputs",
                self.embeddings.len(),
                self.count,
                expected
            )));
        }
        Ok(self.embeddings.into_iter().map(Embedding::new).collect())
    }
}

/// Async client for a remote embedding service.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingClient {
    client: Client,
    base_url: String,
    dimension: usize,
}

impl HttpEmbeddingClient {
    /// Build a client for the service at `base_url` (e.g. `http://10.0.0.5:8080`).
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        dimension: usize,
    ) -> Result<Self, EmbeddingError> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(EmbeddingError::InvalidInput(format!(
                "embedding base URL must be http(s): {base_url}"
            )));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            dimension,
        })
    }

    /// Build a client from the `[embedding]` settings section.
    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self, EmbeddingError> {
        Self::new(
            settings.base_url.clone(),
            Duration::from_secs(settings.timeout_secs),
            settings.dimension,
        )
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, EmbeddingError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        Err(EmbeddingError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("text cannot be empty".to_string()));
        }

        let response = self
            .client
            .post(self.endpoint("encode"))
            .json(&EncodeRequest { text })
            .send()
            .await?;
        let payload: EncodeResponse = Self::check(response).await?.json().await?;
        let embedding = Embedding::from(payload);

        debug!(
            dimension = embedding.dimension(),
            processing_ms = embedding.processing_time.map(|d| d.as_millis() as u64),
            "Encoded text"
        );
        Ok(embedding)
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.endpoint("encode_batch"))
            .json(&EncodeBatchRequest { texts })
            .send()
            .await?;
        let payload: EncodeBatchResponse = Self::check(response).await?.json().await?;
        payload.into_embeddings(texts.len())
    }

    async fn health(&self) -> Result<ProviderHealth, EmbeddingError> {
        let response = self.client.get(self.endpoint("health")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
