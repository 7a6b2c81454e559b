//! Durable log trait and types.
//!
//! Defines the consumer-group operations the pipeline relies on. The
//! pipeline never assumes ordering across consumers; it only relies on
//! single ownership of each entry until it is acknowledged.

use std::time::Duration;

use async_trait::async_trait;
use docsync_types::StreamFields;

use crate::error::LogError;
use crate::id::MessageId;

/// An entry read from a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: MessageId,
    pub fields: StreamFields,
}

impl StreamEntry {
    pub fn new(id: MessageId, fields: StreamFields) -> Self {
        Self { id, fields }
    }
}

/// A delivered but unacknowledged entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: MessageId,
    /// Current owner
    pub consumer: String,
    /// Time since the entry was last delivered
    pub idle: Duration,
    /// How many times the entry has been delivered
    pub delivery_count: u64,
}

/// Where a newly created group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Deliver every entry still in the stream
    Beginning,
    /// Deliver only entries appended after creation
    NewOnly,
}

/// Outcome of [`DurableLog::create_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// Stream-level counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    /// Entries currently retained
    pub length: usize,
    /// Entries ever appended, including trimmed ones
    pub entries_added: u64,
    /// Number of consumer groups
    pub groups: usize,
}

/// Append-only, capacity-bounded log with consumer groups.
///
/// Implementations must be thread-safe; a single log handle is shared by
/// every stage running in the process.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append an entry, trimming the oldest entries beyond `capacity`.
    ///
    /// Creates the stream if needed.
    async fn append(
        &self,
        stream: &str,
        fields: StreamFields,
        capacity: usize,
    ) -> Result<MessageId, LogError>;

    /// Create a consumer group, creating the stream if needed.
    ///
    /// An existing group is reported as [`GroupCreation::AlreadyExists`],
    /// not as an error.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupCreation, LogError>;

    /// Read up to `max_count` never-delivered entries for `consumer`.
    ///
    /// Blocks up to `block` when nothing is available. Returned entries
    /// become pending and owned by `consumer` until acknowledged.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, LogError>;

    /// Acknowledge an entry, removing it from the group's pending list.
    ///
    /// Returns false if the entry was not pending.
    async fn ack(&self, stream: &str, group: &str, id: &MessageId) -> Result<bool, LogError>;

    /// List up to `max_count` pending entries of the group, oldest first.
    async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        max_count: usize,
    ) -> Result<Vec<PendingEntry>, LogError>;

    /// Reassign pending entries idle for at least `min_idle` to `consumer`.
    ///
    /// Entries that are not pending, not idle long enough, or already
    /// trimmed from the stream are not returned.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<StreamEntry>, LogError>;

    /// Stream counters, used for monitoring.
    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, LogError>;

    /// Up to `max_count` retained entries, oldest first.
    async fn range(&self, stream: &str, max_count: usize) -> Result<Vec<StreamEntry>, LogError>;
}
