//! Consumer run loop shared by both consuming stages.
//!
//! A worker runs its startup check, sweeps stale pending entries, then
//! reads batches until cancelled. Messages within a batch are handled
//! one at a time. Cancellation is only observed between messages, so a
//! message whose handling has started (retry loop included) always
//! finishes; an interrupted run simply leaves entries pending for the
//! next sweep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use docsync_log::{DurableLog, LogError, StreamEntry};

use crate::config::ConsumerConfig;
use crate::error::PipelineError;
use crate::recovery::PendingSweep;
use crate::stats::{StageCounters, StageStats};

/// What happened to a message that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Effect produced, then acknowledged
    Completed,
    /// Acknowledged without output
    Skipped,
}

/// Per-batch tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub read: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BatchReport {
    fn record(&mut self, result: &Result<MessageOutcome, PipelineError>) {
        match result {
            Ok(MessageOutcome::Completed) => self.completed += 1,
            Ok(MessageOutcome::Skipped) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// A consumer-group member of one stage.
#[async_trait]
pub trait StageWorker: Send + Sync {
    /// Stage name for logs
    fn name(&self) -> &str;

    fn config(&self) -> &ConsumerConfig;

    fn log(&self) -> &Arc<dyn DurableLog>;

    fn counters(&self) -> &StageCounters;

    /// Verify dependencies and join the consumer group.
    async fn startup(&self) -> Result<(), PipelineError>;

    /// Handle one entry, acknowledging it on success or poison.
    ///
    /// An error means the entry was left unacknowledged.
    async fn handle(&self, entry: &StreamEntry) -> Result<MessageOutcome, PipelineError>;

    fn stats(&self) -> StageStats {
        self.counters().snapshot()
    }

    /// Claim stale pending entries and run them through [`handle`](Self::handle).
    async fn recover(&self, cancel: &CancellationToken) -> Result<BatchReport, LogError> {
        let sweep = PendingSweep::new(self.log().clone(), self.config());
        let claimed = sweep.claim_stale().await?;
        self.counters().record_reclaimed(claimed.len());
        let report = handle_entries(self, &claimed, cancel).await;
        if report.read > 0 {
            info!(
                stage = self.name(),
                reclaimed = report.read,
                completed = report.completed,
                skipped = report.skipped,
                failed = report.failed,
                "Recovery sweep finished"
            );
        }
        Ok(report)
    }

    /// Read one batch of new entries and handle each of them.
    ///
    /// Returns an empty report if cancelled while waiting for entries.
    async fn process_batch(&self, cancel: &CancellationToken) -> Result<BatchReport, LogError> {
        let config = self.config();
        let read = self.log().read_group(
            &config.stream,
            &config.group,
            config.consumer.as_str(),
            config.batch_size,
            config.block_timeout,
        );
        let entries = tokio::select! {
            _ = cancel.cancelled() => return Ok(BatchReport::default()),
            entries = read => entries?,
        };

        if entries.is_empty() {
            debug!(stage = self.name(), "No new messages");
            return Ok(BatchReport::default());
        }

        debug!(stage = self.name(), count = entries.len(), "Read batch");
        Ok(handle_entries(self, &entries, cancel).await)
    }
}

async fn handle_entries<W: StageWorker + ?Sized>(
    worker: &W,
    entries: &[StreamEntry],
    cancel: &CancellationToken,
) -> BatchReport {
    let mut report = BatchReport::default();
    for entry in entries {
        if cancel.is_cancelled() {
            debug!(
                stage = worker.name(),
                remaining = entries.len() - report.read,
                "Cancelled, leaving remaining entries pending"
            );
            break;
        }
        report.read += 1;

        let result = worker.handle(entry).await;
        report.record(&result);
        if let Err(e) = result {
            worker.counters().record_failed();
            error!(
                stage = worker.name(),
                message_id = %entry.id,
                error = %e,
                "Message left pending"
            );
            pause(worker.config().error_pause, cancel).await;
        }
    }
    report
}

/// Sleep unless cancelled first.
async fn pause(duration: Duration, cancel: &CancellationToken) {
    if duration.is_zero() {
        return;
    }
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Run `worker` until `cancel` fires.
///
/// Only a failed startup check ends the loop early; log and message
/// errors are logged and the loop continues.
pub async fn run_worker<W: StageWorker + ?Sized>(
    worker: &W,
    cancel: CancellationToken,
) -> Result<StageStats, PipelineError> {
    worker.startup().await?;
    info!(
        stage = worker.name(),
        consumer = %worker.config().consumer,
        stream = %worker.config().stream,
        group = %worker.config().group,
        "Worker started"
    );

    if let Err(e) = worker.recover(&cancel).await {
        warn!(stage = worker.name(), error = %e, "Startup recovery sweep failed");
    }
    let mut last_sweep = Instant::now();

    while !cancel.is_cancelled() {
        match worker.process_batch(&cancel).await {
            // A log that returns without waiting must not starve the runtime.
            Ok(report) if report.read == 0 => tokio::task::yield_now().await,
            Ok(_) => {}
            Err(e) => {
                error!(stage = worker.name(), error = %e, "Failed to read from log");
                pause(worker.config().read_error_pause, &cancel).await;
            }
        }

        if let Some(interval) = worker.config().sweep.interval {
            if last_sweep.elapsed() >= interval && !cancel.is_cancelled() {
                if let Err(e) = worker.recover(&cancel).await {
                    warn!(stage = worker.name(), error = %e, "Recovery sweep failed");
                }
                last_sweep = Instant::now();
            }
        }
    }

    let stats = worker.stats();
    info!(
        stage = worker.name(),
        processed = stats.processed,
        completed = stats.completed,
        skipped = stats.skipped,
        failed = stats.failed,
        reclaimed = stats.reclaimed,
        "Worker stopped"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use docsync_log::{InMemoryLog, StartPosition};
    use docsync_types::{ConsumerSettings, StreamFields};

    use crate::config::{ConsumerId, SweepConfig};

    /// Acks entries whose `doc_id` is not "bad"; fails "bad" ones.
    struct EchoWorker {
        log: Arc<dyn DurableLog>,
        config: ConsumerConfig,
        counters: StageCounters,
        startups: AtomicU32,
    }

    impl EchoWorker {
        fn new(log: Arc<dyn DurableLog>) -> Self {
            let config = ConsumerConfig::new(
                "s1",
                "g",
                ConsumerId::new("echo"),
                &ConsumerSettings::default(),
            )
            .with_block_timeout(Duration::from_millis(50))
            .with_error_pause(Duration::from_millis(10))
            .with_sweep(SweepConfig {
                min_idle: Duration::from_secs(60),
                max_pending: 100,
                interval: None,
            });
            Self {
                log,
                config,
                counters: StageCounters::new(),
                startups: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StageWorker for EchoWorker {
        fn name(&self) -> &str {
            "echo"
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
            self.startups.fetch_add(1, Ordering::SeqCst);
            self.log
                .create_group(&self.config.stream, &self.config.group, StartPosition::Beginning)
                .await?;
            Ok(())
        }

        async fn handle(&self, entry: &StreamEntry) -> Result<MessageOutcome, PipelineError> {
            self.counters.record_processed();
            if entry.fields.get("doc_id").map(String::as_str) == Some("bad") {
                return Err(PipelineError::Startup("unavailable".into()));
            }
            self.log
                .ack(&self.config.stream, &self.config.group, &entry.id)
                .await?;
            self.counters.record_completed();
            Ok(MessageOutcome::Completed)
        }
    }

    fn fields(doc_id: &str) -> StreamFields {
        let mut fields = StreamFields::new();
        fields.insert("doc_id".to_string(), doc_id.to_string());
        fields
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_batch_reports_outcomes() {
        let log: Arc<dyn DurableLog> = Arc::new(InMemoryLog::new());
        let worker = EchoWorker::new(log.clone());
        worker.startup().await.unwrap();

        log.append("s1", fields("a"), 100).await.unwrap();
        log.append("s1", fields("bad"), 100).await.unwrap();
        log.append("s1", fields("b"), 100).await.unwrap();

        let cancel = CancellationToken::new();
        let report = worker.process_batch(&cancel).await.unwrap();
        assert_eq!(
            report,
            BatchReport {
                read: 3,
                completed: 2,
                skipped: 0,
                failed: 1,
            }
        );

        let pending = log.list_pending("s1", "g", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(worker.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_batch_leaves_entries_pending() {
        let log: Arc<dyn DurableLog> = Arc::new(InMemoryLog::new());
        let worker = EchoWorker::new(log.clone());
        worker.startup().await.unwrap();
        log.append("s1", fields("a"), 100).await.unwrap();

        let entries = log
            .read_group("s1", "g", "echo", 10, Duration::ZERO)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = handle_entries(&worker, &entries, &cancel).await;

        assert_eq!(report.read, 0);
        assert_eq!(log.list_pending("s1", "g", 10).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_worker_until_cancelled() {
        let log: Arc<dyn DurableLog> = Arc::new(InMemoryLog::new());
        let worker = Arc::new(EchoWorker::new(log.clone()));
        let cancel = CancellationToken::new();

        let handle = {
            let worker = worker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { run_worker(worker.as_ref(), cancel).await })
        };

        for doc_id in ["a", "b", "c"] {
            log.append("s1", fields(doc_id), 100).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.completed, 3);
        assert_eq!(worker.startups.load(Ordering::SeqCst), 1);
        assert!(log.list_pending("s1", "g", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_blocking_reads_do_not_starve_runtime() {
        let log: Arc<dyn DurableLog> = Arc::new(InMemoryLog::new());
        let mut worker = EchoWorker::new(log.clone());
        worker.config = worker.config.with_block_timeout(Duration::ZERO);
        let worker = Arc::new(worker);
        let cancel = CancellationToken::new();

        let handle = {
            let worker = worker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { run_worker(worker.as_ref(), cancel).await })
        };

        // Single-threaded runtime: this only resumes if the worker yields.
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append("s1", fields("a"), 100).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker never yielded")
            .unwrap()
            .unwrap();
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_reclaims_from_dead_consumer() {
        let log: Arc<dyn DurableLog> = Arc::new(InMemoryLog::new());
        let worker = EchoWorker::new(log.clone());
        worker.startup().await.unwrap();
        log.append("s1", fields("a"), 100).await.unwrap();
        log.read_group("s1", "g", "dead", 10, Duration::ZERO)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let cancel = CancellationToken::new();
        let report = worker.recover(&cancel).await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(worker.stats().reclaimed, 1);
        assert!(log.list_pending("s1", "g", 10).await.unwrap().is_empty());
    }
}
