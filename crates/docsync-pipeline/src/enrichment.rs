//! Enrichment stage: Stage-1 raw changes to Stage-2 embedded documents.
//!
//! For each Stage-1 entry:
//! - delete: forward a tombstone
//! - insert/update with empty `subject content` text: acknowledge, no output
//! - insert/update: embed with retry, append to Stage-2
//!
//! The Stage-1 entry is acknowledged only after the Stage-2 append
//! succeeded. A crash in between causes a re-embed and a duplicate
//! Stage-2 message, which the index stage absorbs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use docsync_embeddings::EmbeddingProvider;
use docsync_log::{DurableLog, GroupCreation, MessageId, StartPosition, StreamEntry};
use docsync_types::{EmbeddedMessage, RawMessage, Settings};

use crate::config::{ConsumerConfig, StreamTarget};
use crate::error::PipelineError;
use crate::retry::RetryPolicy;
use crate::stats::StageCounters;
use crate::worker::{MessageOutcome, StageWorker};

pub struct EnrichmentConsumer {
    log: Arc<dyn DurableLog>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: ConsumerConfig,
    output: StreamTarget,
    retry: RetryPolicy,
    counters: StageCounters,
}

impl EnrichmentConsumer {
    pub fn new(
        log: Arc<dyn DurableLog>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: ConsumerConfig,
        output: StreamTarget,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            log,
            embedder,
            config,
            output,
            retry,
            counters: StageCounters::new(),
        }
    }

    pub fn from_settings(
        log: Arc<dyn DurableLog>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: &Settings,
    ) -> Self {
        Self::new(
            log,
            embedder,
            ConsumerConfig::enrichment(settings),
            StreamTarget::new(
                &settings.streams.embedded_stream,
                settings.streams.embedded_capacity,
            ),
            RetryPolicy::from(&settings.retry),
        )
    }

    async fn ack(&self, id: &MessageId) -> Result<(), PipelineError> {
        self.log
            .ack(&self.config.stream, &self.config.group, id)
            .await?;
        Ok(())
    }

    /// Acknowledge an entry that will never produce output.
    async fn skip(&self, id: &MessageId) -> Result<MessageOutcome, PipelineError> {
        self.ack(id).await?;
        self.counters.record_skipped();
        Ok(MessageOutcome::Skipped)
    }
}

#[async_trait]
impl StageWorker for EnrichmentConsumer {
    fn name(&self) -> &str {
        "enrichment"
    }

    fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    fn log(&self) -> &Arc<dyn DurableLog> {
        &self.log
    }

    fn counters(&self) -> &StageCounters {
        &self.counters
    }

    async fn startup(&self) -> Result<(), PipelineError> {
        let health = self
            .embedder
            .health()
            .await
            .map_err(|e| PipelineError::Startup(format!("embedding provider: {e}")))?;
        info!(
            model = %health.model,
            vector_size = health.vector_size,
            device = %health.device,
            status = %health.status,
            "Embedding provider ready"
        );
        if health.vector_size != self.embedder.dimension() {
            return Err(PipelineError::Startup(format!(
                "embedding provider reports dimension {}, expected {}",
                health.vector_size,
                self.embedder.dimension()
            )));
        }

        let created = self
            .log
            .create_group(&self.config.stream, &self.config.group, StartPosition::Beginning)
            .await?;
        if created == GroupCreation::Created {
            info!(stream = %self.config.stream, group = %self.config.group, "Created consumer group");
        }
        Ok(())
    }

    async fn handle(&self, entry: &StreamEntry) -> Result<MessageOutcome, PipelineError> {
        self.counters.record_processed();

        let event = match RawMessage::from_fields(&entry.fields) {
            Ok(message) => message.into_event(),
            Err(e) => {
                error!(message_id = %entry.id, error = %e, "Undecodable Stage-1 message, skipping");
                return self.skip(&entry.id).await;
            }
        };
        let source_id = Some(entry.id.to_string());

        let output = if event.is_delete() {
            EmbeddedMessage::tombstone(&event, source_id)
        } else {
            let text = event
                .document
                .as_ref()
                .map(|doc| doc.embedding_text())
                .unwrap_or_default();
            if text.trim().is_empty() {
                warn!(doc_id = %event.doc_id, "Empty embedding text, document left out of the index");
                return self.skip(&entry.id).await;
            }

            let embedding = self
                .retry
                .run("encode", |_| self.embedder.encode(&text))
                .await?;
            EmbeddedMessage::embedded(&event, embedding.into_values(), source_id)
        };

        let fields = output.to_fields()?;
        let forwarded_id = self
            .retry
            .run("append", |_| {
                self.log
                    .append(&self.output.stream, fields.clone(), self.output.capacity)
            })
            .await?;
        self.ack(&entry.id).await?;
        self.counters.record_completed();

        info!(
            doc_id = %event.doc_id,
            operation = %event.operation,
            message_id = %entry.id,
            forwarded_id = %forwarded_id,
            "Forwarded to Stage-2"
        );
        Ok(MessageOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use docsync_embeddings::MockEmbedder;
    use docsync_log::InMemoryLog;
    use docsync_types::{ChangeEvent, ConsumerSettings, DocumentFields, Operation, StreamFields};

    use crate::config::ConsumerId;

    struct Fixture {
        log: Arc<InMemoryLog>,
        embedder: Arc<MockEmbedder>,
        consumer: EnrichmentConsumer,
    }

    async fn fixture() -> Fixture {
        let log = Arc::new(InMemoryLog::new());
        let embedder = Arc::new(MockEmbedder::new(4));
        let config = ConsumerConfig::new(
            "raw",
            "embedding_processors",
            ConsumerId::new("embedder_test"),
            &ConsumerSettings::default(),
        );
        let consumer = EnrichmentConsumer::new(
            log.clone(),
            embedder.clone(),
            config,
            StreamTarget::new("embedded", 100),
            RetryPolicy::new(3, Duration::from_millis(10)),
        );
        consumer.startup().await.unwrap();
        Fixture {
            log,
            embedder,
            consumer,
        }
    }

    async fn deliver(fx: &Fixture, event: ChangeEvent) -> StreamEntry {
        fx.log
            .append("raw", RawMessage::new(event).to_fields(), 100)
            .await
            .unwrap();
        let mut entries = fx
            .log
            .read_group("raw", "embedding_processors", "embedder_test", 1, Duration::ZERO)
            .await
            .unwrap();
        entries.remove(0)
    }

    async fn pending(fx: &Fixture) -> usize {
        fx.log
            .list_pending("raw", "embedding_processors", 100)
            .await
            .unwrap()
            .len()
    }

    async fn forwarded(fx: &Fixture) -> Vec<EmbeddedMessage> {
        fx.log
            .range("embedded", 100)
            .await
            .unwrap()
            .iter()
            .map(|entry| EmbeddedMessage::from_fields(&entry.fields).unwrap())
            .collect()
    }

    fn doc(subject: &str, content: &str) -> DocumentFields {
        DocumentFields {
            subject: subject.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_is_embedded_and_forwarded() {
        let fx = fixture().await;
        let entry = deliver(&fx, ChangeEvent::upsert(Operation::Insert, "A", doc("S", "C"))).await;

        let outcome = fx.consumer.handle(&entry).await.unwrap();

        assert_eq!(outcome, MessageOutcome::Completed);
        assert_eq!(fx.embedder.encoded_texts(), vec!["S C"]);
        let out = forwarded(&fx).await;
        assert_eq!(out.len(), 1);
        match &out[0] {
            EmbeddedMessage::Document(doc) => {
                assert_eq!(doc.doc_id, "A");
                assert_eq!(doc.vector, fx.embedder.vector_for("S C"));
                assert_eq!(doc.source_message_id, Some(entry.id.to_string()));
            }
            other => panic!("expected document, got {other:?}"),
        }
        assert_eq!(pending(&fx).await, 0);
    }

    #[tokio::test]
    async fn test_delete_forwards_tombstone_without_embedding() {
        let fx = fixture().await;
        let entry = deliver(&fx, ChangeEvent::delete("A")).await;

        fx.consumer.handle(&entry).await.unwrap();

        assert_eq!(fx.embedder.calls(), 0);
        let out = forwarded(&fx).await;
        assert!(matches!(&out[0], EmbeddedMessage::Tombstone(t) if t.doc_id == "A"));
        assert_eq!(pending(&fx).await, 0);
    }

    #[tokio::test]
    async fn test_empty_text_is_acked_without_output() {
        let fx = fixture().await;
        let entry = deliver(&fx, ChangeEvent::upsert(Operation::Insert, "E", doc("", "  "))).await;

        let outcome = fx.consumer.handle(&entry).await.unwrap();

        assert_eq!(outcome, MessageOutcome::Skipped);
        assert!(forwarded(&fx).await.is_empty());
        assert_eq!(pending(&fx).await, 0);
        assert_eq!(fx.consumer.stats().skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_embedding_exhaustion_leaves_message_pending() {
        let fx = fixture().await;
        fx.embedder.fail_next(3);
        let entry = deliver(&fx, ChangeEvent::upsert(Operation::Update, "A", doc("S", "C"))).await;

        let result = fx.consumer.handle(&entry).await;

        assert!(matches!(result, Err(PipelineError::Embedding(_))));
        assert_eq!(fx.embedder.calls(), 3);
        assert!(forwarded(&fx).await.is_empty());
        assert_eq!(pending(&fx).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_embedding_failure_is_retried() {
        let fx = fixture().await;
        fx.embedder.fail_next(2);
        let entry = deliver(&fx, ChangeEvent::upsert(Operation::Insert, "A", doc("S", "C"))).await;

        assert_eq!(
            fx.consumer.handle(&entry).await.unwrap(),
            MessageOutcome::Completed
        );
        assert_eq!(forwarded(&fx).await.len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_skipped() {
        let fx = fixture().await;
        let mut fields = StreamFields::new();
        fields.insert("operation".into(), "truncate".into());
        fields.insert("doc_id".into(), "A".into());
        fx.log.append("raw", fields, 100).await.unwrap();
        let entries = fx
            .log
            .read_group("raw", "embedding_processors", "embedder_test", 1, Duration::ZERO)
            .await
            .unwrap();

        let outcome = fx.consumer.handle(&entries[0]).await.unwrap();

        assert_eq!(outcome, MessageOutcome::Skipped);
        assert!(forwarded(&fx).await.is_empty());
        assert_eq!(pending(&fx).await, 0);
    }

    #[tokio::test]
    async fn test_startup_rejects_dimension_mismatch() {
        struct Lying(MockEmbedder);

        #[async_trait]
        impl EmbeddingProvider for Lying {
            fn dimension(&self) -> usize {
                384
            }

            async fn encode(
                &self,
                text: &str,
            ) -> Result<docsync_embeddings::Embedding, docsync_embeddings::EmbeddingError> {
                self.0.encode(text).await
            }

            async fn health(
                &self,
            ) -> Result<docsync_embeddings::ProviderHealth, docsync_embeddings::EmbeddingError>
            {
                self.0.health().await
            }
        }

        let consumer = EnrichmentConsumer::new(
            Arc::new(InMemoryLog::new()),
            Arc::new(Lying(MockEmbedder::new(4))),
            ConsumerConfig::new("raw", "g", ConsumerId::new("c"), &ConsumerSettings::default()),
            StreamTarget::new("embedded", 100),
            RetryPolicy::no_retry(),
        );
        assert!(matches!(
            consumer.startup().await,
            Err(PipelineError::Startup(_))
        ));
    }
}
