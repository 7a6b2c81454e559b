//! Configuration loading for docsync.
//!
//! Layered config: defaults -> config file -> env vars.
//! The default config file lives at ~/.config/docsync/config.toml;
//! environment variables use the `DOCSYNC_` prefix with `__` between
//! nested keys (e.g. `DOCSYNC_EMBEDDING__BASE_URL`).

use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::SyncError;

/// Names and capacity bounds of the two stage logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Stage-1 stream name
    pub raw_stream: String,
    /// Stage-2 stream name
    pub embedded_stream: String,
    /// Stage-1 capacity; older entries are trimmed beyond this
    pub raw_capacity: usize,
    /// Stage-2 capacity
    pub embedded_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            raw_stream: "raw_document_changes".to_string(),
            embedded_stream: "embedded_documents".to_string(),
            raw_capacity: 10_000,
            embedded_capacity: 10_000,
        }
    }
}

/// Consumer group names, one per consuming stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSettings {
    pub enrichment: String,
    pub indexing: String,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            enrichment: "embedding_processors".to_string(),
            indexing: "qdrant_upserters".to_string(),
        }
    }
}

/// Embedding service connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Base URL of the embedding service (e.g. "http://127.0.0.1:8080")
    pub base_url: String,
    /// Per-request timeout
    pub timeout_secs: u64,
    /// Vector dimension produced by the provider
    pub dimension: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            timeout_secs: 30,
            dimension: 384,
        }
    }
}

/// Vector store connection and collection layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreSettings {
    pub url: String,
    pub collection: String,
    /// Distance metric name ("cosine", "dot", "euclid", "manhattan")
    pub distance: String,
    pub dimension: usize,
    pub timeout_secs: u64,
    /// API key, usually from `DOCSYNC_VECTOR_STORE__API_KEY`; never serialized
    #[serde(skip_serializing)]
    pub api_key: Option<SecretString>,
}

impl Default for VectorStoreSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:6333".to_string(),
            collection: "documents".to_string(),
            distance: "cosine".to_string(),
            dimension: 384,
            timeout_secs: 30,
            api_key: None,
        }
    }
}

/// Bounded retry for calls to the embedding provider and vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

/// Change feed reopen policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Consecutive failed opens before capture gives up
    pub max_feed_attempts: u32,
    /// Upper bound on the reopen delay
    pub max_backoff_secs: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_feed_attempts: 3,
            max_backoff_secs: 60,
        }
    }
}

/// Redis connection backing both stage logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Connection URL (e.g. "redis://127.0.0.1:6379/0")
    pub url: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

/// Source collection watched by change capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// MongoDB connection string
    pub uri: String,
    pub database: String,
    pub collection: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            uri: "mongodb://127.0.0.1:27017".to_string(),
            database: "docsync".to_string(),
            collection: "documents".to_string(),
        }
    }
}

/// Read loop tuning for one consuming stage.
///
/// Each stage has its own defaults ([`ConsumerSettings::enrichment`],
/// [`ConsumerSettings::indexing`]); keys missing from a partially
/// specified section fall back to that stage's values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Maximum messages per read
    pub batch_size: usize,
    /// How long a read blocks waiting for new messages; must be > 0
    pub block_timeout_ms: u64,
    /// Pause after a message fails
    pub error_pause_ms: u64,
    /// Pause after the log itself fails
    pub read_error_pause_ms: u64,
}

impl ConsumerSettings {
    pub fn enrichment() -> Self {
        Self {
            batch_size: 5,
            error_pause_ms: 2000,
            ..Self::indexing()
        }
    }

    pub fn indexing() -> Self {
        Self {
            batch_size: 10,
            block_timeout_ms: 5000,
            error_pause_ms: 1000,
            read_error_pause_ms: 5000,
        }
    }

    fn overlay(self, section: ConsumerSection) -> Self {
        Self {
            batch_size: section.batch_size.unwrap_or(self.batch_size),
            block_timeout_ms: section.block_timeout_ms.unwrap_or(self.block_timeout_ms),
            error_pause_ms: section.error_pause_ms.unwrap_or(self.error_pause_ms),
            read_error_pause_ms: section
                .read_error_pause_ms
                .unwrap_or(self.read_error_pause_ms),
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::indexing()
    }
}

/// A consumer section as written, before stage defaults are applied.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConsumerSection {
    batch_size: Option<usize>,
    block_timeout_ms: Option<u64>,
    error_pause_ms: Option<u64>,
    read_error_pause_ms: Option<u64>,
}

fn enrichment_section<'de, D>(deserializer: D) -> Result<ConsumerSettings, D::Error>
where
    D: Deserializer<'de>,
{
    let section = ConsumerSection::deserialize(deserializer)?;
    Ok(ConsumerSettings::enrichment().overlay(section))
}

fn indexing_section<'de, D>(deserializer: D) -> Result<ConsumerSettings, D::Error>
where
    D: Deserializer<'de>,
{
    let section = ConsumerSection::deserialize(deserializer)?;
    Ok(ConsumerSettings::indexing().overlay(section))
}

/// Pending-message reclamation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Only entries idle at least this long are claimed
    pub min_idle_ms: u64,
    /// Maximum pending entries inspected per sweep
    pub max_pending: usize,
    /// Interval between periodic sweeps; 0 sweeps only at startup
    pub sweep_interval_secs: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            min_idle_ms: 60_000,
            max_pending: 100,
            sweep_interval_secs: 0,
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub streams: StreamSettings,

    #[serde(default)]
    pub groups: GroupSettings,

    #[serde(default)]
    pub embedding: EmbeddingSettings,

    #[serde(default)]
    pub vector_store: VectorStoreSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub capture: CaptureSettings,

    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub source: SourceSettings,

    #[serde(
        default = "ConsumerSettings::enrichment",
        deserialize_with = "enrichment_section"
    )]
    pub enrichment: ConsumerSettings,

    #[serde(
        default = "ConsumerSettings::indexing",
        deserialize_with = "indexing_section"
    )]
    pub indexing: ConsumerSettings,

    #[serde(default)]
    pub recovery: RecoverySettings,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            streams: StreamSettings::default(),
            groups: GroupSettings::default(),
            embedding: EmbeddingSettings::default(),
            vector_store: VectorStoreSettings::default(),
            retry: RetrySettings::default(),
            capture: CaptureSettings::default(),
            broker: BrokerSettings::default(),
            source: SourceSettings::default(),
            enrichment: ConsumerSettings::enrichment(),
            indexing: ConsumerSettings::indexing(),
            recovery: RecoverySettings::default(),
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/docsync/config.toml)
    /// 3. Explicit config file (optional)
    /// 4. Environment variables (DOCSYNC_*)
    pub fn load(config_path: Option<&str>) -> Result<Self, SyncError> {
        let config_dir = ProjectDirs::from("", "", "docsync")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("DOCSYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| SyncError::Config(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), SyncError> {
        let fail = |msg: String| Err(SyncError::Config(msg));

        if self.embedding.dimension == 0 {
            return fail("embedding.dimension must be > 0".to_string());
        }
        if self.embedding.dimension != self.vector_store.dimension {
            return fail(format!(
                "embedding.dimension ({}) must match vector_store.dimension ({})",
                self.embedding.dimension, self.vector_store.dimension
            ));
        }
        if self.streams.raw_capacity == 0 || self.streams.embedded_capacity == 0 {
            return fail("stream capacities must be > 0".to_string());
        }
        if self.enrichment.batch_size == 0 || self.indexing.batch_size == 0 {
            return fail("batch_size must be > 0".to_string());
        }
        // A zero block means "wait forever" to a stream broker.
        if self.enrichment.block_timeout_ms == 0 || self.indexing.block_timeout_ms == 0 {
            return fail("block_timeout_ms must be > 0".to_string());
        }
        if self.vector_store.distance.trim().is_empty() {
            return fail("vector_store.distance must be set".to_string());
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be > 0".to_string());
        }
        if self.capture.max_feed_attempts == 0 {
            return fail("capture.max_feed_attempts must be > 0".to_string());
        }
        if self.streams.raw_stream == self.streams.embedded_stream {
            return fail("raw_stream and embedded_stream must differ".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.streams.raw_stream, "raw_document_changes");
        assert_eq!(settings.streams.embedded_stream, "embedded_documents");
        assert_eq!(settings.streams.raw_capacity, 10_000);
        assert_eq!(settings.groups.enrichment, "embedding_processors");
        assert_eq!(settings.groups.indexing, "qdrant_upserters");
        assert_eq!(settings.embedding.dimension, 384);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.enrichment.batch_size, 5);
        assert_eq!(settings.indexing.batch_size, 10);
        assert_eq!(settings.recovery.min_idle_ms, 60_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[streams]
raw_capacity = 500

[vector_store]
collection = "tickets"

[indexing]
batch_size = 25
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.streams.raw_capacity, 500);
        assert_eq!(settings.streams.embedded_capacity, 10_000);
        assert_eq!(settings.vector_store.collection, "tickets");
        assert_eq!(settings.indexing.batch_size, 25);
        assert_eq!(settings.enrichment.batch_size, 5);
    }

    #[test]
    fn test_partial_stage_sections_keep_stage_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[enrichment]
block_timeout_ms = 250

[indexing]
block_timeout_ms = 750
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(settings.enrichment.block_timeout_ms, 250);
        assert_eq!(settings.enrichment.batch_size, 5);
        assert_eq!(settings.enrichment.error_pause_ms, 2000);
        assert_eq!(settings.indexing.block_timeout_ms, 750);
        assert_eq!(settings.indexing.batch_size, 10);
        assert_eq!(settings.indexing.error_pause_ms, 1000);
    }

    #[test]
    fn test_api_key_is_secret() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[vector_store]
api_key = "qdrant-key-123"
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path().to_str().unwrap())).unwrap();
        let key = settings.vector_store.api_key.as_ref().unwrap();
        assert_eq!(secrecy::ExposeSecret::expose_secret(key), "qdrant-key-123");
        assert!(!format!("{settings:?}").contains("qdrant-key-123"));
        assert!(!serde_json::to_string(&settings)
            .unwrap()
            .contains("qdrant-key-123"));
    }

    #[test]
    fn test_connection_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.broker.url, "redis://127.0.0.1:6379/0");
        assert_eq!(settings.source.uri, "mongodb://127.0.0.1:27017");
        assert_eq!(settings.embedding.base_url, "http://127.0.0.1:8080");
        assert_eq!(settings.vector_store.url, "http://127.0.0.1:6333");
    }

    #[test]
    fn test_validate_rejects_zero_block_timeout() {
        let mut settings = Settings::default();
        settings.indexing.block_timeout_ms = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("block_timeout_ms"));
    }

    #[test]
    fn test_validate_dimension_mismatch() {
        let mut settings = Settings::default();
        settings.vector_store.dimension = 768;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("must match"));
    }

    #[test]
    fn test_validate_zero_values() {
        let mut settings = Settings::default();
        settings.streams.raw_capacity = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.retry.max_attempts = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.indexing.batch_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_serialization() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let decoded: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.vector_store.distance, "cosine");
        assert_eq!(decoded.enrichment.error_pause_ms, 2000);
    }
}
