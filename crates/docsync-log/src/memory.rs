//! In-process implementation of [`DurableLog`].
//!
//! Mirrors broker stream semantics closely enough to back the whole
//! pipeline in tests or single-process deployments: monotonic ids,
//! capacity trimming on append, per-group delivery cursors, pending
//! lists with idle tracking, and claim.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use docsync_types::StreamFields;

use crate::error::LogError;
use crate::id::MessageId;
use crate::log::{DurableLog, GroupCreation, PendingEntry, StartPosition, StreamEntry, StreamInfo};

#[derive(Debug)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug)]
struct GroupState {
    /// Highest id ever delivered to this group
    last_delivered: MessageId,
    pending: BTreeMap<MessageId, PendingState>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: VecDeque<StreamEntry>,
    last_id: MessageId,
    entries_added: u64,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn find(&self, id: &MessageId) -> Option<&StreamEntry> {
        self.entries
            .binary_search_by_key(id, |entry| entry.id)
            .ok()
            .map(|idx| &self.entries[idx])
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut GroupState, LogError> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| LogError::NoSuchGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Thread-safe in-memory durable log.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, StreamState>>, LogError> {
        self.streams
            .lock()
            .map_err(|e| LogError::Other(format!("log lock poisoned: {e}")))
    }

    fn missing_group(stream: &str, group: &str) -> LogError {
        LogError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    }

    /// Deliver new entries to `consumer`; does not block.
    fn deliver(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let mut streams = self.lock()?;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| Self::missing_group(stream, group))?;

        let cursor = state
            .groups
            .get(group)
            .ok_or_else(|| Self::missing_group(stream, group))?
            .last_delivered;

        let batch: Vec<StreamEntry> = state
            .entries
            .iter()
            .filter(|entry| entry.id > cursor)
            .take(max_count.max(1))
            .cloned()
            .collect();

        if let Some(last) = batch.last() {
            let now = Instant::now();
            let group_state = state.group_mut(stream, group)?;
            group_state.last_delivered = last.id;
            for entry in &batch {
                group_state.pending.insert(
                    entry.id,
                    PendingState {
                        consumer: consumer.to_string(),
                        delivered_at: now,
                        delivery_count: 1,
                    },
                );
            }
            trace!(stream, group, consumer, count = batch.len(), "Delivered entries");
        }

        Ok(batch)
    }
}

#[async_trait]
impl DurableLog for InMemoryLog {
    async fn append(
        &self,
        stream: &str,
        fields: StreamFields,
        capacity: usize,
    ) -> Result<MessageId, LogError> {
        let id = {
            let mut streams = self.lock()?;
            let state = streams.entry(stream.to_string()).or_default();

            let id = state.last_id.next_after(now_millis());
            state.last_id = id;
            state.entries_added += 1;
            state.entries.push_back(StreamEntry::new(id, fields));

            let mut trimmed = 0usize;
            while state.entries.len() > capacity.max(1) {
                state.entries.pop_front();
                trimmed += 1;
            }
            if trimmed > 0 {
                debug!(stream, trimmed, capacity, "Trimmed oldest entries");
            }
            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupCreation, LogError> {
        let mut streams = self.lock()?;
        let state = streams.entry(stream.to_string()).or_default();

        if state.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }

        let last_delivered = match start {
            StartPosition::Beginning => MessageId::ZERO,
            StartPosition::NewOnly => state.last_id,
        };
        state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(GroupCreation::Created)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, LogError> {
        let deadline = Instant::now() + block;

        loop {
            // Register before checking so an append between the check and
            // the wait still wakes us.
            let appended = self.appended.notified();

            let batch = self.deliver(stream, group, consumer, max_count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, appended).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &MessageId) -> Result<bool, LogError> {
        let mut streams = self.lock()?;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| Self::missing_group(stream, group))?;
        Ok(state.group_mut(stream, group)?.pending.remove(id).is_some())
    }

    async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        max_count: usize,
    ) -> Result<Vec<PendingEntry>, LogError> {
        let mut streams = self.lock()?;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| Self::missing_group(stream, group))?;
        let now = Instant::now();

        Ok(state
            .group_mut(stream, group)?
            .pending
            .iter()
            .take(max_count)
            .map(|(id, pending)| PendingEntry {
                id: *id,
                consumer: pending.consumer.clone(),
                idle: now.saturating_duration_since(pending.delivered_at),
                delivery_count: pending.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<StreamEntry>, LogError> {
        let mut streams = self.lock()?;
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| Self::missing_group(stream, group))?;
        let now = Instant::now();

        let mut claimable = Vec::new();
        let mut trimmed = Vec::new();
        {
            let group_state = state
                .groups
                .get(group)
                .ok_or_else(|| Self::missing_group(stream, group))?;
            for id in ids {
                let Some(pending) = group_state.pending.get(id) else {
                    continue;
                };
                if now.saturating_duration_since(pending.delivered_at) < min_idle {
                    continue;
                }
                match state.find(id) {
                    Some(entry) => claimable.push(entry.clone()),
                    None => trimmed.push(*id),
                }
            }
        }

        let group_state = state.group_mut(stream, group)?;
        for id in trimmed {
            // The entry is gone; nothing left to redeliver.
            group_state.pending.remove(&id);
            debug!(stream, group, id = %id, "Dropped pending entry for trimmed message");
        }
        for entry in &claimable {
            if let Some(pending) = group_state.pending.get_mut(&entry.id) {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                pending.delivery_count += 1;
            }
        }

        Ok(claimable)
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, LogError> {
        let streams = self.lock()?;
        let state = streams
            .get(stream)
            .ok_or_else(|| LogError::NoSuchStream(stream.to_string()))?;
        Ok(StreamInfo {
            length: state.entries.len(),
            entries_added: state.entries_added,
            groups: state.groups.len(),
        })
    }

    async fn range(&self, stream: &str, max_count: usize) -> Result<Vec<StreamEntry>, LogError> {
        let streams = self.lock()?;
        Ok(streams
            .get(stream)
            .map(|state| state.entries.iter().take(max_count).cloned().collect())
            .unwrap_or_default())
    }
}
