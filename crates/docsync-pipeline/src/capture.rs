//! Change capture: source change feed to the Stage-1 log.
//!
//! Notifications use the change-stream shape
//! `{operationType, documentKey: {_id}, fullDocument}`. Each one becomes
//! exactly one Stage-1 message. A malformed notification is logged and
//! skipped. A failing feed is reopened with backoff
//! `min(max_backoff, 2^failures)` seconds; too many consecutive failures
//! end capture with [`CaptureError::FeedExhausted`], leaving the restart
//! to whatever supervises the process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use docsync_log::DurableLog;
use docsync_types::{
    CaptureSettings, ChangeEvent, DocumentFields, Operation, RawMessage, Settings, SyncError,
};

use crate::config::StreamTarget;
use crate::error::{CaptureError, FeedError};
use crate::retry::RetryPolicy;
use crate::stats::{StageCounters, StageStats};

/// Source of change notifications.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn open(&self) -> Result<Box<dyn ChangeSubscription>, FeedError>;
}

/// An open change feed.
#[async_trait]
pub trait ChangeSubscription: Send {
    /// Next raw notification; `None` once the feed is closed for good.
    async fn next_change(&mut self) -> Result<Option<Value>, FeedError>;
}

/// Sending half of a [`ChannelChangeFeed`].
pub type ChangeSender = mpsc::Sender<Result<Value, FeedError>>;

/// Change feed fed through a tokio channel.
///
/// Sending `Err` simulates a connection loss; dropping every sender
/// closes the feed.
#[derive(Clone)]
pub struct ChannelChangeFeed {
    receiver: Arc<Mutex<mpsc::Receiver<Result<Value, FeedError>>>>,
    failed_opens: Arc<AtomicU64>,
}

impl ChannelChangeFeed {
    pub fn new(buffer: usize) -> (ChangeSender, Self) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let feed = Self {
            receiver: Arc::new(Mutex::new(receiver)),
            failed_opens: Arc::new(AtomicU64::new(0)),
        };
        (sender, feed)
    }

    /// Make the next `count` opens fail.
    pub fn fail_next_opens(&self, count: u64) {
        self.failed_opens.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChangeFeed for ChannelChangeFeed {
    async fn open(&self) -> Result<Box<dyn ChangeSubscription>, FeedError> {
        if self
            .failed_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FeedError::Unavailable("injected open failure".to_string()));
        }
        Ok(Box::new(ChannelSubscription {
            receiver: self.receiver.clone(),
        }))
    }
}

struct ChannelSubscription {
    receiver: Arc<Mutex<mpsc::Receiver<Result<Value, FeedError>>>>,
}

#[async_trait]
impl ChangeSubscription for ChannelSubscription {
    async fn next_change(&mut self) -> Result<Option<Value>, FeedError> {
        match self.receiver.lock().await.recv().await {
            Some(Ok(raw)) => Ok(Some(raw)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Normalize a raw change notification.
pub fn normalize(raw: &Value) -> Result<ChangeEvent, SyncError> {
    let operation = match raw.get("operationType").and_then(Value::as_str) {
        Some("insert") => Operation::Insert,
        Some("update") | Some("replace") => Operation::Update,
        Some("delete") => Operation::Delete,
        Some(other) => return Err(SyncError::UnknownOperation(other.to_string())),
        None => return Err(SyncError::MissingField("operationType")),
    };

    let doc_id = raw
        .get("documentKey")
        .and_then(|key| key.get("_id"))
        .ok_or(SyncError::MissingField("documentKey._id"))
        .and_then(document_id)?;

    if operation == Operation::Delete {
        return Ok(ChangeEvent::delete(doc_id));
    }

    let document = match raw.get("fullDocument") {
        Some(Value::Object(_)) => &raw["fullDocument"],
        _ => return Err(SyncError::MissingField("fullDocument")),
    };
    let content = match document.get("body") {
        Some(body) if !body.is_null() => text(Some(body)),
        _ => text(document.get("content")),
    };
    let fields = DocumentFields {
        product: text(document.get("product")),
        customer: text(document.get("customer")),
        owner: text(document.get("owner")),
        date: text(document.get("date")),
        subject: text(document.get("subject")),
        content,
    };
    Ok(ChangeEvent::upsert(operation, doc_id, fields))
}

/// `_id` as a string: plain string, number, or `{"$oid": ...}`.
fn document_id(id: &Value) -> Result<String, SyncError> {
    let doc_id = match id {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Object(map) => match map.get("$oid").and_then(Value::as_str) {
            Some(oid) => oid.to_string(),
            None => return Err(SyncError::invalid("_id", "unsupported object id")),
        },
        other => return Err(SyncError::invalid("_id", format!("unsupported id {other}"))),
    };
    if doc_id.is_empty() {
        return Err(SyncError::invalid("_id", "empty id"));
    }
    Ok(doc_id)
}

/// Field value as text; missing and null become "".
fn text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) if map.contains_key("$date") => text(map.get("$date")),
        Some(other) => other.to_string(),
    }
}

/// Reopen delay after the `failures`-th consecutive feed failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedRetryPolicy {
    pub max_attempts: u32,
    pub max_backoff: Duration,
}

impl FeedRetryPolicy {
    pub fn delay(&self, failures: u32) -> Duration {
        let secs = 2u64.checked_pow(failures).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max_backoff)
    }
}

impl From<&CaptureSettings> for FeedRetryPolicy {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            max_attempts: settings.max_feed_attempts.max(1),
            max_backoff: Duration::from_secs(settings.max_backoff_secs),
        }
    }
}

/// Tails a change feed into the Stage-1 log.
pub struct ChangeCapture {
    feed: Arc<dyn ChangeFeed>,
    log: Arc<dyn DurableLog>,
    output: StreamTarget,
    feed_retry: FeedRetryPolicy,
    append_retry: RetryPolicy,
    counters: StageCounters,
    reopens: AtomicU64,
}

impl ChangeCapture {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        log: Arc<dyn DurableLog>,
        output: StreamTarget,
        feed_retry: FeedRetryPolicy,
        append_retry: RetryPolicy,
    ) -> Self {
        Self {
            feed,
            log,
            output,
            feed_retry,
            append_retry,
            counters: StageCounters::new(),
            reopens: AtomicU64::new(0),
        }
    }

    pub fn from_settings(
        feed: Arc<dyn ChangeFeed>,
        log: Arc<dyn DurableLog>,
        settings: &Settings,
    ) -> Self {
        Self::new(
            feed,
            log,
            StreamTarget::new(&settings.streams.raw_stream, settings.streams.raw_capacity),
            FeedRetryPolicy::from(&settings.capture),
            RetryPolicy::from(&settings.retry),
        )
    }

    /// Captured (completed), malformed (skipped) and unappendable (failed) notifications.
    pub fn stats(&self) -> StageStats {
        self.counters.snapshot()
    }

    /// Times the feed was reopened after a failure.
    pub fn reopens(&self) -> u64 {
        self.reopens.load(Ordering::Relaxed)
    }

    /// Normalize and append one notification. Failures are logged, not returned.
    pub async fn capture_one(&self, raw: &Value) {
        self.counters.record_processed();

        let event = match normalize(raw) {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "Malformed change notification, skipping");
                self.counters.record_skipped();
                return;
            }
        };

        let doc_id = event.doc_id.clone();
        let operation = event.operation;
        let fields = RawMessage::new(event).to_fields();
        let appended = self
            .append_retry
            .run("append", |_| {
                self.log
                    .append(&self.output.stream, fields.clone(), self.output.capacity)
            })
            .await;

        match appended {
            Ok(id) => {
                self.counters.record_completed();
                info!(
                    operation = %operation,
                    doc_id = %doc_id,
                    message_id = %id,
                    "Captured change"
                );
            }
            Err(e) => {
                self.counters.record_failed();
                error!(doc_id = %doc_id, error = %e, "Failed to append change");
            }
        }
    }

    /// Record a feed failure and wait before reopening.
    ///
    /// Returns the fatal error once the failures are used up.
    async fn after_failure(
        &self,
        failures: u32,
        error: FeedError,
        cancel: &CancellationToken,
    ) -> Result<(), CaptureError> {
        error!(
            attempt = failures,
            max_attempts = self.feed_retry.max_attempts,
            error = %error,
            "Change feed error"
        );
        if failures >= self.feed_retry.max_attempts {
            return Err(CaptureError::FeedExhausted {
                attempts: failures,
                last_error: error,
            });
        }

        let delay = self.feed_retry.delay(failures);
        info!(retry_in_secs = delay.as_secs(), "Reopening change feed");
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
        self.reopens.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Capture until the feed closes, `cancel` fires, or the feed fails
    /// too many times in a row.
    pub async fn run(&self, cancel: CancellationToken) -> Result<StageStats, CaptureError> {
        let mut failures = 0;

        'feed: while !cancel.is_cancelled() {
            let mut subscription = match self.feed.open().await {
                Ok(subscription) => {
                    failures = 0;
                    info!(stream = %self.output.stream, "Watching change feed");
                    subscription
                }
                Err(e) => {
                    failures += 1;
                    self.after_failure(failures, e, &cancel).await?;
                    continue;
                }
            };

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break 'feed,
                    next = subscription.next_change() => next,
                };
                match next {
                    Ok(Some(raw)) => self.capture_one(&raw).await,
                    Ok(None) => {
                        info!("Change feed closed");
                        break 'feed;
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(error = %e, "Change feed interrupted");
                        self.after_failure(failures, e, &cancel).await?;
                        continue 'feed;
                    }
                }
            }
        }

        let stats = self.stats();
        debug!(
            captured = stats.completed,
            skipped = stats.skipped,
            failed = stats.failed,
            reopens = self.reopens(),
            "Change capture stopped"
        );
        Ok(stats)
    }
}
