//! Durable log error types.

use thiserror::Error;

/// Errors returned by a [`crate::DurableLog`] implementation.
#[derive(Debug, Error)]
pub enum LogError {
    /// Broker could not be reached or timed out
    #[error("Connection error: {0}")]
    Connection(String),

    /// Stream does not exist
    #[error("No such stream: {0}")]
    NoSuchStream(String),

    /// Consumer group does not exist on the stream
    #[error("No such consumer group {group} on stream {stream}")]
    NoSuchGroup { stream: String, group: String },

    /// Malformed message id
    #[error("Invalid message id: {0}")]
    InvalidId(String),

    /// Any other broker-side failure
    #[error("Log error: {0}")]
    Other(String),
}
