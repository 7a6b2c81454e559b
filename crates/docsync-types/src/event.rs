//! Change event type for source-database notifications.
//!
//! A change event is created once, when the change is captured, and is
//! never mutated afterwards. Insert and update events carry the full
//! current document; delete events carry only the identifier.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Kind of change applied to a source document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Document was created
    Insert,
    /// Document was modified
    Update,
    /// Document was removed
    Delete,
}

impl Operation {
    /// Wire name of the operation
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// True for operations that carry a document body.
    pub fn carries_document(&self) -> bool {
        !matches!(self, Operation::Delete)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(SyncError::UnknownOperation(other.to_string())),
        }
    }
}

/// Denormalized document fields copied from the source record.
///
/// Missing source fields are represented as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFields {
    pub product: String,
    pub customer: String,
    pub owner: String,
    pub date: String,
    pub subject: String,
    pub content: String,
}

impl DocumentFields {
    /// Text used as embedding input: non-empty subject and content joined by a space.
    pub fn embedding_text(&self) -> String {
        [self.subject.as_str(), self.content.as_str()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A normalized change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// What happened to the document
    pub operation: Operation,

    /// Source document identifier
    pub doc_id: String,

    /// Current document fields; `None` for deletes
    pub document: Option<DocumentFields>,

    /// When the change was captured
    pub source_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create an insert or update event stamped with the current time.
    ///
    /// A `Delete` operation passed here is turned into a delete event and
    /// the document is dropped.
    pub fn upsert(operation: Operation, doc_id: impl Into<String>, document: DocumentFields) -> Self {
        let document = operation.carries_document().then_some(document);
        Self {
            operation,
            doc_id: doc_id.into(),
            document,
            source_timestamp: Utc::now(),
        }
    }

    /// Create a delete event stamped with the current time.
    pub fn delete(doc_id: impl Into<String>) -> Self {
        Self {
            operation: Operation::Delete,
            doc_id: doc_id.into(),
            document: None,
            source_timestamp: Utc::now(),
        }
    }

    /// Override the capture timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.source_timestamp = timestamp;
        self
    }

    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }
}
