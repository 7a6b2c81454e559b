//! Reclamation of messages left pending by crashed replicas.
//!
//! A replica that dies between reading and acknowledging leaves its
//! entries pending under its own name. The sweep lists the group's
//! pending entries, claims the ones idle longer than the threshold for
//! the current consumer, and hands them back for reprocessing. Both
//! stages are idempotent on `doc_id`, so reprocessing an entry whose
//! effect already happened is harmless.

use std::sync::Arc;

use tracing::{debug, info};

use docsync_log::{DurableLog, LogError, MessageId, StreamEntry};

use crate::config::{ConsumerConfig, SweepConfig};

pub struct PendingSweep {
    log: Arc<dyn DurableLog>,
    stream: String,
    group: String,
    consumer: String,
    config: SweepConfig,
}

impl PendingSweep {
    pub fn new(log: Arc<dyn DurableLog>, consumer: &ConsumerConfig) -> Self {
        Self {
            log,
            stream: consumer.stream.clone(),
            group: consumer.group.clone(),
            consumer: consumer.consumer.to_string(),
            config: consumer.sweep,
        }
    }

    /// Claim stale pending entries for this consumer.
    ///
    /// Returns the claimed entries in pending order. Entries trimmed
    /// from the stream in the meantime are not returned.
    pub async fn claim_stale(&self) -> Result<Vec<StreamEntry>, LogError> {
        let pending = self
            .log
            .list_pending(&self.stream, &self.group, self.config.max_pending)
            .await?;

        let stale: Vec<MessageId> = pending
            .iter()
            .filter(|entry| entry.idle >= self.config.min_idle)
            .map(|entry| entry.id)
            .collect();

        if stale.is_empty() {
            debug!(
                stream = %self.stream,
                pending = pending.len(),
                "No stale pending entries"
            );
            return Ok(Vec::new());
        }

        let claimed = self
            .log
            .claim(
                &self.stream,
                &self.group,
                &self.consumer,
                self.config.min_idle,
                &stale,
            )
            .await?;

        info!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer,
            stale = stale.len(),
            claimed = claimed.len(),
            "Claimed pending entries"
        );
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use docsync_log::{InMemoryLog, StartPosition};
    use docsync_types::{ConsumerSettings, StreamFields};

    use crate::config::ConsumerId;

    fn consumer_config(name: &str) -> ConsumerConfig {
        ConsumerConfig::new("s1", "g", ConsumerId::new(name), &ConsumerSettings::default())
            .with_sweep(SweepConfig {
                min_idle: Duration::from_secs(60),
                max_pending: 100,
                interval: None,
            })
    }

    fn fields(doc_id: &str) -> StreamFields {
        let mut fields = StreamFields::new();
        fields.insert("doc_id".to_string(), doc_id.to_string());
        fields
    }

    #[tokio::test(start_paused = true)]
    async fn test_claims_only_stale_entries() {
        let log = Arc::new(InMemoryLog::new());
        log.create_group("s1", "g", StartPosition::Beginning)
            .await
            .unwrap();
        log.append("s1", fields("A"), 100).await.unwrap();

        // Crashed replica reads and never acks
        let read = log
            .read_group("s1", "g", "dead", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);

        let sweep = PendingSweep::new(log.clone(), &consumer_config("alive"));
        assert!(sweep.claim_stale().await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        let claimed = sweep.claim_stale().await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].fields["doc_id"], "A");

        let pending = log.list_pending("s1", "g", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "alive");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_empty_group() {
        let log = Arc::new(InMemoryLog::new());
        log.create_group("s1", "g", StartPosition::Beginning)
            .await
            .unwrap();
        let sweep = PendingSweep::new(log, &consumer_config("alive"));
        assert!(sweep.claim_stale().await.unwrap().is_empty());
    }
}
