//! Error types for the docsync system.

use thiserror::Error;

/// Unified error type for shared docsync types.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required wire field is absent
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// A wire field is present but cannot be interpreted
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Unknown operation name
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
}

impl SyncError {
    /// Shorthand for [`SyncError::InvalidField`].
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        SyncError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
