//! Embedding provider trait and types.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EmbeddingError;

/// A vector produced by the provider.
///
/// Values are kept exactly as returned; no normalization is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Server-reported inference time, when available
    pub processing_time: Option<Duration>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            processing_time: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }
}

/// Result of the provider health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: String,
    pub model: String,
    pub vector_size: usize,
    pub device: String,
    #[serde(default)]
    pub total_requests: Option<u64>,
}

/// Text -> vector function with a fixed output dimension.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Dimension of every vector this provider returns.
    fn dimension(&self) -> usize;

    /// Generate the embedding for a single text.
    async fn encode(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// Generate embeddings for multiple texts, in input order.
    /// Default implementation calls encode() for each text.
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.encode(text).await?);
        }
        Ok(embeddings)
    }

    /// Check the provider: model identity, dimension, device.
    async fn health(&self) -> Result<ProviderHealth, EmbeddingError>;
}
