//! # docsync-pipeline
//!
//! The stages that keep a vector index in sync with a source database:
//!
//! ```text
//! change feed -> ChangeCapture -> Stage-1 log -> EnrichmentConsumer
//!             -> Stage-2 log -> IndexConsumer -> vector store
//! ```
//!
//! Delivery is at-least-once. Each consumer acknowledges a message only
//! after its effect (Stage-2 append, store mutation) succeeded, and every
//! mutation targets `point_id(doc_id)`, so redelivery is harmless.
//! Messages left pending by a crashed replica are reclaimed by
//! [`PendingSweep`].
//!
//! ## Running a stage
//!
//! ```ignore
//! let consumer = IndexConsumer::from_settings(log, store, &settings);
//! let cancel = CancellationToken::new();
//! run_worker(&consumer, cancel.clone()).await?;
//! ```

pub mod capture;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod indexer;
pub mod monitor;
pub mod mongo;
pub mod recovery;
pub mod retry;
pub mod stats;
pub mod telemetry;
pub mod worker;

pub use capture::{
    normalize, ChangeCapture, ChangeFeed, ChangeSender, ChangeSubscription, ChannelChangeFeed,
    FeedRetryPolicy,
};
pub use config::{ConsumerConfig, ConsumerId, StreamTarget, SweepConfig};
pub use enrichment::EnrichmentConsumer;
pub use error::{CaptureError, FeedError, PipelineError};
pub use indexer::IndexConsumer;
pub use monitor::{BacklogThresholds, PipelineMonitor, PipelineSnapshot, StageSnapshot};
pub use mongo::MongoChangeFeed;
pub use recovery::PendingSweep;
pub use retry::RetryPolicy;
pub use stats::{StageCounters, StageStats};
pub use telemetry::init_tracing;
pub use worker::{run_worker, BatchReport, MessageOutcome, StageWorker};
