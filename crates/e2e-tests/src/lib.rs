//! End-to-end test infrastructure for docsync.
//!
//! Wires every stage over the in-memory log, the mock embedder, and the
//! in-memory vector store, and provides helpers to feed changes in and
//! step the consumers by hand.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use docsync_embeddings::MockEmbedder;
use docsync_log::{DurableLog, InMemoryLog, MessageId, StreamEntry};
use docsync_pipeline::{
    BatchReport, ChangeCapture, ChannelChangeFeed, EnrichmentConsumer, IndexConsumer,
    PipelineMonitor, StageWorker,
};
use docsync_types::{ChangeEvent, DocumentFields, EmbeddedMessage, Operation, RawMessage, Settings};
use docsync_vector::{CollectionConfig, Distance, InMemoryVectorStore};

/// Vector dimension used by every harness.
pub const TEST_DIMENSION: usize = 8;

/// Install a test-writer tracing subscriber once per test binary.
///
/// Honors `RUST_LOG`; silent by default.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Settings for tests: small dimension, fast retries, reads that barely block.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.embedding.dimension = TEST_DIMENSION;
    settings.vector_store.dimension = TEST_DIMENSION;
    settings.retry.base_delay_ms = 10;
    for consumer in [&mut settings.enrichment, &mut settings.indexing] {
        consumer.block_timeout_ms = 1;
        consumer.error_pause_ms = 0;
        consumer.read_error_pause_ms = 0;
    }
    settings
}

/// Shared test harness: all stages over in-memory dependencies.
pub struct TestPipeline {
    pub settings: Settings,
    pub log: Arc<InMemoryLog>,
    pub embedder: Arc<MockEmbedder>,
    pub store: Arc<InMemoryVectorStore>,
    pub enrichment: EnrichmentConsumer,
    pub indexer: IndexConsumer,
}

impl TestPipeline {
    /// Build the harness and run both consumers' startup checks.
    pub async fn start() -> Self {
        Self::start_with(test_settings()).await
    }

    pub async fn start_with(settings: Settings) -> Self {
        init_test_tracing();
        settings.validate().expect("invalid test settings");

        let log = Arc::new(InMemoryLog::new());
        let embedder = Arc::new(MockEmbedder::new(settings.embedding.dimension));
        let store = Arc::new(InMemoryVectorStore::new(CollectionConfig::new(
            settings.vector_store.collection.clone(),
            settings.vector_store.dimension,
            Distance::Cosine,
        )));

        let enrichment = EnrichmentConsumer::from_settings(log.clone(), embedder.clone(), &settings);
        let indexer = IndexConsumer::from_settings(log.clone(), store.clone(), &settings);
        enrichment.startup().await.expect("enrichment startup failed");
        indexer.startup().await.expect("indexer startup failed");

        Self {
            settings,
            log,
            embedder,
            store,
            enrichment,
            indexer,
        }
    }

    /// A second enrichment replica sharing this pipeline's log.
    pub fn enrichment_replica(&self) -> EnrichmentConsumer {
        EnrichmentConsumer::from_settings(self.log.clone(), self.embedder.clone(), &self.settings)
    }

    /// A second index replica sharing this pipeline's log and store.
    pub fn indexer_replica(&self) -> IndexConsumer {
        IndexConsumer::from_settings(self.log.clone(), self.store.clone(), &self.settings)
    }

    /// Change capture over a fresh channel feed.
    pub fn capture(&self) -> (docsync_pipeline::ChangeSender, ChangeCapture) {
        let (sender, feed) = ChannelChangeFeed::new(64);
        let capture = ChangeCapture::from_settings(Arc::new(feed), self.log.clone(), &self.settings);
        (sender, capture)
    }

    pub fn monitor(&self) -> PipelineMonitor {
        PipelineMonitor::new(self.log.clone(), &self.settings)
            .with_embedder(self.embedder.clone())
            .with_store(self.store.clone())
    }

    /// Append a change directly to Stage-1.
    pub async fn emit(&self, event: ChangeEvent) -> MessageId {
        self.log
            .append(
                &self.settings.streams.raw_stream,
                RawMessage::new(event).to_fields(),
                self.settings.streams.raw_capacity,
            )
            .await
            .expect("Stage-1 append failed")
    }

    pub async fn insert(&self, doc_id: &str, subject: &str, content: &str) -> MessageId {
        self.emit(ChangeEvent::upsert(Operation::Insert, doc_id, document(subject, content)))
            .await
    }

    pub async fn update(&self, doc_id: &str, subject: &str, content: &str) -> MessageId {
        self.emit(ChangeEvent::upsert(Operation::Update, doc_id, document(subject, content)))
            .await
    }

    pub async fn delete(&self, doc_id: &str) -> MessageId {
        self.emit(ChangeEvent::delete(doc_id)).await
    }

    /// Run one enrichment batch.
    pub async fn step_enrichment(&self) -> BatchReport {
        self.enrichment
            .process_batch(&CancellationToken::new())
            .await
            .expect("Stage-1 read failed")
    }

    /// Run one index batch.
    pub async fn step_indexer(&self) -> BatchReport {
        self.indexer
            .process_batch(&CancellationToken::new())
            .await
            .expect("Stage-2 read failed")
    }

    /// Step both consumers until neither reads anything new.
    pub async fn drain(&self) {
        loop {
            let enriched = self.step_enrichment().await;
            let indexed = self.step_indexer().await;
            if enriched.read == 0 && indexed.read == 0 {
                break;
            }
        }
    }

    pub async fn raw_entries(&self) -> Vec<StreamEntry> {
        self.log
            .range(&self.settings.streams.raw_stream, usize::MAX)
            .await
            .expect("Stage-1 range failed")
    }

    /// Decoded Stage-2 messages, oldest first.
    pub async fn embedded_messages(&self) -> Vec<EmbeddedMessage> {
        self.log
            .range(&self.settings.streams.embedded_stream, usize::MAX)
            .await
            .expect("Stage-2 range failed")
            .iter()
            .map(|entry| EmbeddedMessage::from_fields(&entry.fields).expect("bad Stage-2 message"))
            .collect()
    }

    pub async fn raw_pending(&self) -> usize {
        self.log
            .list_pending(
                &self.settings.streams.raw_stream,
                &self.settings.groups.enrichment,
                usize::MAX,
            )
            .await
            .expect("Stage-1 pending failed")
            .len()
    }

    pub async fn embedded_pending(&self) -> usize {
        self.log
            .list_pending(
                &self.settings.streams.embedded_stream,
                &self.settings.groups.indexing,
                usize::MAX,
            )
            .await
            .expect("Stage-2 pending failed")
            .len()
    }
}

pub fn document(subject: &str, content: &str) -> DocumentFields {
    DocumentFields {
        product: "Widget".to_string(),
        customer: "Acme".to_string(),
        owner: "ops".to_string(),
        date: "2024-03-01".to_string(),
        subject: subject.to_string(),
        content: content.to_string(),
    }
}

/// A change notification in change-stream shape.
pub fn change_notification(operation: &str, doc_id: &str, subject: &str, body: &str) -> Value {
    if operation == "delete" {
        return json!({"operationType": "delete", "documentKey": {"_id": doc_id}});
    }
    json!({
        "operationType": operation,
        "documentKey": {"_id": doc_id},
        "fullDocument": {
            "_id": doc_id,
            "product": "Widget",
            "customer": "Acme",
            "owner": "ops",
            "date": "2024-03-01",
            "subject": subject,
            "body": body
        }
    })
}
