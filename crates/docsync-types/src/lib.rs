//! # docsync-types
//!
//! Shared domain types for the docsync pipeline.
//!
//! This crate defines the data that flows between stages:
//! - Change events: normalized source-database notifications
//! - Stage messages: the Stage-1 (raw) and Stage-2 (embedded) wire schemas
//! - Index points: what ends up in the vector store, keyed by a
//!   deterministic point id
//! - Settings: layered configuration for every stage
//!
//! ## Usage
//!
//! ```rust
//! use docsync_types::{point_id, ChangeEvent, DocumentFields, Operation};
//!
//! let event = ChangeEvent::upsert(Operation::Insert, "A", DocumentFields::default());
//! assert_eq!(point_id(&event.doc_id), point_id("A"));
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod point;

pub use config::{
    BrokerSettings, CaptureSettings, ConsumerSettings, EmbeddingSettings, GroupSettings,
    RecoverySettings, RetrySettings, Settings, SourceSettings, StreamSettings,
    VectorStoreSettings,
};
pub use error::SyncError;
pub use event::{ChangeEvent, DocumentFields, Operation};
pub use message::{
    content_preview, EmbeddedDocument, EmbeddedMessage, RawMessage, StreamFields, Tombstone,
    CONTENT_PREVIEW_CHARS, STAGE_EMBEDDED, STAGE_RAW,
};
pub use point::{point_id, IndexPoint, PointPayload, POINT_NAMESPACE};
