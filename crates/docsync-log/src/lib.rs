//! # docsync-log
//!
//! The narrow durable-log interface the pipeline is written against.
//!
//! The pipeline needs an append-only, capacity-bounded log with consumer
//! groups: each entry is owned by one group member until acknowledged,
//! pending entries can be listed, and idle ones can be claimed by another
//! member. [`DurableLog`] captures exactly those operations so that any
//! compliant broker, such as [`RedisLog`], or [`InMemoryLog`] can back
//! the stages.
//!
//! ## Key Components
//!
//! - [`DurableLog`]: append / create_group / read_group / ack / list_pending / claim
//! - [`MessageId`]: broker-assigned, monotonically increasing entry id
//! - [`InMemoryLog`]: in-process implementation with the same semantics
//! - [`RedisLog`]: Redis Streams implementation

pub mod error;
pub mod id;
pub mod log;
pub mod memory;
pub mod redis_log;

pub use error::LogError;
pub use id::MessageId;
pub use log::{DurableLog, GroupCreation, PendingEntry, StartPosition, StreamEntry, StreamInfo};
pub use memory::InMemoryLog;
pub use redis_log::RedisLog;
