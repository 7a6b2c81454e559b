//! Index stage: Stage-2 messages to vector store mutations.
//!
//! Every message targets `point_id(doc_id)`, so upserts and deletes are
//! idempotent under redelivery and the last applied mutation wins. The
//! Stage-2 entry is acknowledged only after the store accepted the
//! mutation. Undecodable messages and vectors of the wrong dimension are
//! acknowledged without touching the store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use docsync_log::{DurableLog, GroupCreation, MessageId, StartPosition, StreamEntry};
use docsync_types::{point_id, EmbeddedMessage, IndexPoint, Settings};
use docsync_vector::VectorStore;

use crate::config::ConsumerConfig;
use crate::error::PipelineError;
use crate::retry::RetryPolicy;
use crate::stats::StageCounters;
use crate::worker::{MessageOutcome, StageWorker};

pub struct IndexConsumer {
    log: Arc<dyn DurableLog>,
    store: Arc<dyn VectorStore>,
    config: ConsumerConfig,
    retry: RetryPolicy,
    counters: StageCounters,
}

impl IndexConsumer {
    pub fn new(
        log: Arc<dyn DurableLog>,
        store: Arc<dyn VectorStore>,
        config: ConsumerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            log,
            store,
            config,
            retry,
            counters: StageCounters::new(),
        }
    }

    pub fn from_settings(
        log: Arc<dyn DurableLog>,
        store: Arc<dyn VectorStore>,
        settings: &Settings,
    ) -> Self {
        Self::new(
            log,
            store,
            ConsumerConfig::indexing(settings),
            RetryPolicy::from(&settings.retry),
        )
    }

    async fn ack(&self, id: &MessageId) -> Result<(), PipelineError> {
        self.log
            .ack(&self.config.stream, &self.config.group, id)
            .await?;
        Ok(())
    }

    /// Acknowledge a message that can never be applied.
    async fn skip(&self, id: &MessageId) -> Result<MessageOutcome, PipelineError> {
        self.ack(id).await?;
        self.counters.record_skipped();
        Ok(MessageOutcome::Skipped)
    }

    /// Apply one decoded message to the store.
    async fn apply(&self, message: &EmbeddedMessage) -> Result<(), PipelineError> {
        let id = point_id(message.doc_id());
        match message {
            EmbeddedMessage::Tombstone(_) => {
                self.retry.run("delete", |_| self.store.delete(id)).await?;
            }
            EmbeddedMessage::Document(doc) => {
                let expected = self.store.collection().dimension;
                if doc.vector_size() != expected {
                    return Err(PipelineError::DimensionMismatch {
                        expected,
                        actual: doc.vector_size(),
                    });
                }
                let point = IndexPoint::from_document(doc);
                self.retry
                    .run("upsert", |_| self.store.upsert(&point))
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StageWorker for IndexConsumer {
    fn name(&self) -> &str {
        "indexing"
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
        self.store
            .ensure_collection()
            .await
            .map_err(|e| PipelineError::Startup(format!("vector store: {e}")))?;

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

        let message = match EmbeddedMessage::from_fields(&entry.fields) {
            Ok(message) => message,
            Err(e) => {
                error!(message_id = %entry.id, error = %e, "Undecodable Stage-2 message, skipping");
                return self.skip(&entry.id).await;
            }
        };

        match self.apply(&message).await {
            Ok(()) => {}
            Err(e) if e.is_poison() => {
                error!(
                    doc_id = %message.doc_id(),
                    message_id = %entry.id,
                    error = %e,
                    "Poison Stage-2 message, skipping"
                );
                return self.skip(&entry.id).await;
            }
            Err(e) => return Err(e),
        }

        self.ack(&entry.id).await?;
        self.counters.record_completed();
        info!(
            doc_id = %message.doc_id(),
            operation = %message.operation(),
            point_id = %point_id(message.doc_id()),
            message_id = %entry.id,
            "Applied to vector store"
        );
        Ok(MessageOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use docsync_log::InMemoryLog;
    use docsync_types::{ChangeEvent, ConsumerSettings, DocumentFields, Operation};
    use docsync_vector::{CollectionConfig, Distance, InMemoryVectorStore};

    use crate::config::ConsumerId;

    struct Fixture {
        log: Arc<InMemoryLog>,
        store: Arc<InMemoryVectorStore>,
        consumer: IndexConsumer,
    }

    async fn fixture() -> Fixture {
        let log = Arc::new(InMemoryLog::new());
        let store = Arc::new(InMemoryVectorStore::new(CollectionConfig::new(
            "documents",
            3,
            Distance::Cosine,
        )));
        let consumer = IndexConsumer::new(
            log.clone(),
            store.clone(),
            ConsumerConfig::new(
                "embedded",
                "qdrant_upserters",
                ConsumerId::new("upserter_test"),
                &ConsumerSettings::default(),
            ),
            RetryPolicy::new(3, Duration::from_millis(10)),
        );
        consumer.startup().await.unwrap();
        Fixture {
            log,
            store,
            consumer,
        }
    }

    async fn deliver(fx: &Fixture, message: EmbeddedMessage) -> StreamEntry {
        fx.log
            .append("embedded", message.to_fields().unwrap(), 100)
            .await
            .unwrap();
        let mut entries = fx
            .log
            .read_group("embedded", "qdrant_upserters", "upserter_test", 1, Duration::ZERO)
            .await
            .unwrap();
        entries.remove(0)
    }

    async fn pending(fx: &Fixture) -> usize {
        fx.log
            .list_pending("embedded", "qdrant_upserters", 100)
            .await
            .unwrap()
            .len()
    }

    fn embedded(doc_id: &str, vector: Vec<f32>) -> EmbeddedMessage {
        let event = ChangeEvent::upsert(
            Operation::Insert,
            doc_id,
            DocumentFields {
                subject: "S".to_string(),
                content: "C".to_string(),
                ..Default::default()
            },
        );
        EmbeddedMessage::embedded(&event, vector, Some("1-0".to_string()))
    }

    fn tombstone(doc_id: &str) -> EmbeddedMessage {
        EmbeddedMessage::tombstone(&ChangeEvent::delete(doc_id), None)
    }

    #[tokio::test]
    async fn test_startup_ensures_collection() {
        let fx = fixture().await;
        assert!(fx.store.is_created());
    }

    #[tokio::test]
    async fn test_upsert_then_ack() {
        let fx = fixture().await;
        let entry = deliver(&fx, embedded("A", vec![0.1, 0.2, 0.3])).await;

        let outcome = fx.consumer.handle(&entry).await.unwrap();

        assert_eq!(outcome, MessageOutcome::Completed);
        let point = fx.store.get(point_id("A")).unwrap();
        assert_eq!(point.payload.doc_id, "A");
        assert_eq!(point.payload.vector_size, 3);
        assert_eq!(point.payload.source_message_id.as_deref(), Some("1-0"));
        assert_eq!(pending(&fx).await, 0);
    }

    #[tokio::test]
    async fn test_redelivery_keeps_one_point() {
        let fx = fixture().await;
        for _ in 0..3 {
            let entry = deliver(&fx, embedded("A", vec![0.1, 0.2, 0.3])).await;
            fx.consumer.handle(&entry).await.unwrap();
        }
        assert_eq!(fx.store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_point_and_absent_delete_succeeds() {
        let fx = fixture().await;
        let entry = deliver(&fx, embedded("A", vec![0.1, 0.2, 0.3])).await;
        fx.consumer.handle(&entry).await.unwrap();

        let entry = deliver(&fx, tombstone("A")).await;
        assert_eq!(
            fx.consumer.handle(&entry).await.unwrap(),
            MessageOutcome::Completed
        );
        assert!(!fx.store.contains(point_id("A")));

        let entry = deliver(&fx, tombstone("never-inserted")).await;
        assert_eq!(
            fx.consumer.handle(&entry).await.unwrap(),
            MessageOutcome::Completed
        );
        assert_eq!(pending(&fx).await, 0);
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_acked_without_mutation() {
        let fx = fixture().await;
        let entry = deliver(&fx, embedded("A", vec![0.1, 0.2])).await;

        let outcome = fx.consumer.handle(&entry).await.unwrap();

        assert_eq!(outcome, MessageOutcome::Skipped);
        assert!(fx.store.is_empty());
        assert_eq!(fx.store.mutations(), 0);
        assert_eq!(pending(&fx).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_leaves_message_pending() {
        let fx = fixture().await;
        fx.store.fail_next(3);
        let entry = deliver(&fx, embedded("A", vec![0.1, 0.2, 0.3])).await;

        let result = fx.consumer.handle(&entry).await;

        assert!(matches!(result, Err(PipelineError::Vector(_))));
        assert!(fx.store.is_empty());
        assert_eq!(pending(&fx).await, 1);

        // Redelivered after the store comes back
        fx.consumer.handle(&entry).await.unwrap();
        assert!(fx.store.contains(point_id("A")));
        assert_eq!(pending(&fx).await, 0);
    }

    #[tokio::test]
    async fn test_missing_vector_is_poison() {
        let fx = fixture().await;
        let mut fields = embedded("A", vec![0.1, 0.2, 0.3]).to_fields().unwrap();
        fields.remove("vector");
        fx.log.append("embedded", fields, 100).await.unwrap();
        let entries = fx
            .log
            .read_group("embedded", "qdrant_upserters", "upserter_test", 1, Duration::ZERO)
            .await
            .unwrap();

        let outcome = fx.consumer.handle(&entries[0]).await.unwrap();

        assert_eq!(outcome, MessageOutcome::Skipped);
        assert!(fx.store.is_empty());
        assert_eq!(pending(&fx).await, 0);
    }
}
