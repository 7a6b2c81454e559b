//! Backlog and dependency snapshot of a running pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use docsync_embeddings::{EmbeddingProvider, ProviderHealth};
use docsync_log::{DurableLog, LogError};
use docsync_types::Settings;
use docsync_vector::VectorStore;

/// Upper bound on pending entries counted per group.
const PENDING_SCAN_LIMIT: usize = 100_000;

/// Backlog levels above which a snapshot reports a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogThresholds {
    pub raw_length: usize,
    pub embedded_length: usize,
    pub raw_pending: usize,
    pub embedded_pending: usize,
}

impl Default for BacklogThresholds {
    fn default() -> Self {
        Self {
            raw_length: 1000,
            embedded_length: 500,
            raw_pending: 100,
            embedded_pending: 50,
        }
    }
}

/// One stream and its consuming group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSnapshot {
    pub stream: String,
    pub group: String,
    /// Entries currently retained
    pub length: usize,
    /// Entries ever appended
    pub entries_added: u64,
    pub groups: usize,
    /// Delivered but unacknowledged entries of `group`
    pub pending: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    pub taken_at: DateTime<Utc>,
    pub raw: StageSnapshot,
    pub embedded: StageSnapshot,
    /// `None` when no store is attached or it could not be reached
    pub points_count: Option<u64>,
    pub embedder: Option<ProviderHealth>,
    /// Dependencies that could not be queried
    pub errors: Vec<String>,
}

impl PipelineSnapshot {
    pub fn warnings(&self) -> Vec<String> {
        self.warnings_with(&BacklogThresholds::default())
    }

    pub fn warnings_with(&self, thresholds: &BacklogThresholds) -> Vec<String> {
        let mut warnings = Vec::new();
        let checks = [
            (&self.raw, "length", self.raw.length, thresholds.raw_length),
            (&self.raw, "pending", self.raw.pending, thresholds.raw_pending),
            (
                &self.embedded,
                "length",
                self.embedded.length,
                thresholds.embedded_length,
            ),
            (
                &self.embedded,
                "pending",
                self.embedded.pending,
                thresholds.embedded_pending,
            ),
        ];
        for (stage, what, value, limit) in checks {
            if value > limit {
                warnings.push(format!(
                    "{} {what} {value} exceeds {limit}",
                    stage.stream
                ));
            }
        }
        warnings.extend(self.errors.iter().cloned());
        warnings
    }
}

pub struct PipelineMonitor {
    log: Arc<dyn DurableLog>,
    raw: (String, String),
    embedded: (String, String),
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    store: Option<Arc<dyn VectorStore>>,
}

impl PipelineMonitor {
    pub fn new(log: Arc<dyn DurableLog>, settings: &Settings) -> Self {
        Self {
            log,
            raw: (
                settings.streams.raw_stream.clone(),
                settings.groups.enrichment.clone(),
            ),
            embedded: (
                settings.streams.embedded_stream.clone(),
                settings.groups.indexing.clone(),
            ),
            embedder: None,
            store: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.store = Some(store);
        self
    }

    async fn stage(
        &self,
        (stream, group): &(String, String),
        errors: &mut Vec<String>,
    ) -> StageSnapshot {
        let mut snapshot = StageSnapshot {
            stream: stream.clone(),
            group: group.clone(),
            ..Default::default()
        };

        match self.log.stream_info(stream).await {
            Ok(info) => {
                snapshot.length = info.length;
                snapshot.entries_added = info.entries_added;
                snapshot.groups = info.groups;
            }
            // Nothing captured yet
            Err(LogError::NoSuchStream(_)) => return snapshot,
            Err(e) => {
                errors.push(format!("{stream} unavailable: {e}"));
                return snapshot;
            }
        }

        match self.log.list_pending(stream, group, PENDING_SCAN_LIMIT).await {
            Ok(pending) => snapshot.pending = pending.len(),
            Err(LogError::NoSuchGroup { .. }) => {}
            Err(e) => errors.push(format!("{stream} pending unavailable: {e}")),
        }
        snapshot
    }

    pub async fn snapshot(&self) -> PipelineSnapshot {
        let mut errors = Vec::new();
        let raw = self.stage(&self.raw, &mut errors).await;
        let embedded = self.stage(&self.embedded, &mut errors).await;

        let points_count = match &self.store {
            Some(store) => match store.collection_stats().await {
                Ok(stats) => Some(stats.points_count),
                Err(e) => {
                    errors.push(format!("vector store unavailable: {e}"));
                    None
                }
            },
            None => None,
        };

        let embedder = match &self.embedder {
            Some(embedder) => match embedder.health().await {
                Ok(health) => Some(health),
                Err(e) => {
                    errors.push(format!("embedding provider unavailable: {e}"));
                    None
                }
            },
            None => None,
        };

        debug!(
            raw_length = raw.length,
            raw_pending = raw.pending,
            embedded_length = embedded.length,
            embedded_pending = embedded.pending,
            points = ?points_count,
            "Pipeline snapshot"
        );

        PipelineSnapshot {
            taken_at: Utc::now(),
            raw,
            embedded,
            points_count,
            embedder,
            errors,
        }
    }
}
