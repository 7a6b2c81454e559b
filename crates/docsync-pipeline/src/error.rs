//! Pipeline error types.

use thiserror::Error;

use docsync_embeddings::EmbeddingError;
use docsync_log::LogError;
use docsync_types::SyncError;
use docsync_vector::VectorError;

/// Errors raised while processing a stage message.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Durable log failure (read, append, ack, claim)
    #[error("Log error: {0}")]
    Log(#[from] LogError),

    /// Embedding provider failure
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// Vector store failure
    #[error("Vector store error: {0}")]
    Vector(#[from] VectorError),

    /// Message could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] SyncError),

    /// Vector length differs from the collection dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A dependency check failed before consuming
    #[error("Startup check failed: {0}")]
    Startup(String),
}

impl PipelineError {
    /// Whether retrying can never fix this error.
    ///
    /// Poison messages are acknowledged and skipped; every other error
    /// leaves the message pending.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            PipelineError::Decode(_)
                | PipelineError::DimensionMismatch { .. }
                | PipelineError::Vector(VectorError::DimensionMismatch { .. })
        )
    }
}

/// Change feed failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    /// Feed could not be opened
    #[error("Change feed unavailable: {0}")]
    Unavailable(String),

    /// Open feed lost its connection
    #[error("Change feed disconnected: {0}")]
    Disconnected(String),
}

/// Fatal change capture errors.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Reopening the feed failed too many times in a row
    #[error("Change feed failed {attempts} times in a row: {last_error}")]
    FeedExhausted { attempts: u32, last_error: FeedError },
}
