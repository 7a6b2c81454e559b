//! Mock embedder for testing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::EmbeddingError;
use crate::provider::{Embedding, EmbeddingProvider, ProviderHealth};

/// Embedder that derives vectors from a hash of the input text.
///
/// The same text always yields the same vector. Failures can be injected
/// to exercise retry paths, and every successfully encoded text is
/// recorded.
pub struct MockEmbedder {
    dimension: usize,
    failures_remaining: AtomicU32,
    calls: AtomicUsize,
    encoded: Mutex<Vec<String>>,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            failures_remaining: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
            encoded: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `count` encode calls fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Total encode calls, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Texts successfully encoded, in call order.
    pub fn encoded_texts(&self) -> Vec<String> {
        self.encoded
            .lock()
            .map(|texts| texts.clone())
            .unwrap_or_default()
    }

    /// The vector this embedder produces for `text`.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        (0..self.dimension)
            .map(|i| {
                let mut hasher = DefaultHasher::new();
                text.hash(&mut hasher);
                i.hash(&mut hasher);
                // Map to [-1, 1)
                (hasher.finish() % 2000) as f32 / 1000.0 - 1.0
            })
            .collect()
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn encode(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(EmbeddingError::Unavailable("injected failure".to_string()));
        }
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("text cannot be empty".to_string()));
        }
        if let Ok(mut encoded) = self.encoded.lock() {
            encoded.push(text.to_string());
        }
        Ok(Embedding::new(self.vector_for(text)))
    }

    async fn health(&self) -> Result<ProviderHealth, EmbeddingError> {
        Ok(ProviderHealth {
            status: "healthy".to_string(),
            model: "mock-embedder".to_string(),
            vector_size: self.dimension,
            device: "cpu".to_string(),
            total_requests: Some(self.calls() as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vectors_are_deterministic() {
        let embedder = MockEmbedder::new(8);
        let a = embedder.encode("S C").await.unwrap();
        let b = embedder.encode("S C").await.unwrap();
        let c = embedder.encode("other").await.unwrap();

        assert_eq!(a.dimension(), 8);
        assert_eq!(a, b);
        assert_ne!(a.values, c.values);
        assert_eq!(embedder.encoded_texts(), vec!["S C", "S C", "other"]);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let embedder = MockEmbedder::new(4);
        embedder.fail_next(2);

        assert!(embedder.encode("x").await.is_err());
        assert!(embedder.encode("x").await.is_err());
        assert!(embedder.encode("x").await.is_ok());
        assert_eq!(embedder.calls(), 3);
    }

    #[tokio::test]
    async fn test_default_batch_preserves_order() {
        let embedder = MockEmbedder::new(4);
        let texts = vec!["one".to_string(), "two".to_string()];
        let batch = embedder.encode_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].values, embedder.vector_for("one"));
        assert_eq!(batch[1].values, embedder.vector_for("two"));
    }

    #[tokio::test]
    async fn test_health_reports_dimension() {
        let embedder = MockEmbedder::new(384);
        let health = embedder.health().await.unwrap();
        assert_eq!(health.vector_size, 384);
        assert_eq!(health.status, "healthy");
    }
}
