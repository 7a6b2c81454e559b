//! Runtime configuration for the pipeline stages.
//!
//! Built from [`Settings`] sections; tests construct them directly.

use std::fmt;
use std::time::Duration;

use chrono::Utc;

use docsync_types::{ConsumerSettings, RecoverySettings, Settings};

/// Unique name of one consumer replica within its group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// `{prefix}_{unix_seconds}_{pid}`, unique per running replica.
    pub fn generate(prefix: &str) -> Self {
        Self(format!(
            "{prefix}_{}_{}",
            Utc::now().timestamp(),
            std::process::id()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stream a stage appends to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub stream: String,
    /// Older entries are trimmed beyond this
    pub capacity: usize,
}

impl StreamTarget {
    pub fn new(stream: impl Into<String>, capacity: usize) -> Self {
        Self {
            stream: stream.into(),
            capacity,
        }
    }
}

/// Pending-entry reclamation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    /// Only entries idle at least this long are claimed
    pub min_idle: Duration,
    /// Maximum pending entries inspected per sweep
    pub max_pending: usize,
    /// Interval between sweeps after the startup sweep
    pub interval: Option<Duration>,
}

impl From<&RecoverySettings> for SweepConfig {
    fn from(settings: &RecoverySettings) -> Self {
        Self {
            min_idle: Duration::from_millis(settings.min_idle_ms),
            max_pending: settings.max_pending,
            interval: (settings.sweep_interval_secs > 0)
                .then(|| Duration::from_secs(settings.sweep_interval_secs)),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self::from(&RecoverySettings::default())
    }
}

/// Configuration of one consuming stage.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Stream consumed
    pub stream: String,
    /// Consumer group shared by all replicas of the stage
    pub group: String,
    /// This replica's identity
    pub consumer: ConsumerId,
    /// Maximum messages per read
    pub batch_size: usize,
    /// How long a read blocks waiting for messages
    pub block_timeout: Duration,
    /// Pause after a message fails
    pub error_pause: Duration,
    /// Pause after the log read itself fails
    pub read_error_pause: Duration,
    pub sweep: SweepConfig,
}

impl ConsumerConfig {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: ConsumerId,
        settings: &ConsumerSettings,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer,
            batch_size: settings.batch_size.max(1),
            block_timeout: Duration::from_millis(settings.block_timeout_ms),
            error_pause: Duration::from_millis(settings.error_pause_ms),
            read_error_pause: Duration::from_millis(settings.read_error_pause_ms),
            sweep: SweepConfig::default(),
        }
    }

    /// Enrichment stage: reads Stage-1 as `embedder_*`.
    pub fn enrichment(settings: &Settings) -> Self {
        Self::new(
            &settings.streams.raw_stream,
            &settings.groups.enrichment,
            ConsumerId::generate("embedder"),
            &settings.enrichment,
        )
        .with_sweep(SweepConfig::from(&settings.recovery))
    }

    /// Index stage: reads Stage-2 as `upserter_*`.
    pub fn indexing(settings: &Settings) -> Self {
        Self::new(
            &settings.streams.embedded_stream,
            &settings.groups.indexing,
            ConsumerId::generate("upserter"),
            &settings.indexing,
        )
        .with_sweep(SweepConfig::from(&settings.recovery))
    }

    pub fn with_sweep(mut self, sweep: SweepConfig) -> Self {
        self.sweep = sweep;
        self
    }

    pub fn with_consumer(mut self, consumer: ConsumerId) -> Self {
        self.consumer = consumer;
        self
    }

    pub fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    pub fn with_error_pause(mut self, error_pause: Duration) -> Self {
        self.error_pause = error_pause;
        self
    }
}
