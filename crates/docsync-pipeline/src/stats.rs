//! Process-local stage counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of [`StageCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    /// Messages or notifications taken up
    pub processed: u64,
    /// Forwarded downstream or applied to the store, then acknowledged
    pub completed: u64,
    /// Acknowledged without output (poison or intentionally skipped)
    pub skipped: u64,
    /// Left unacknowledged after an error
    pub failed: u64,
    /// Taken over from another consumer by a recovery sweep
    pub reclaimed: u64,
}

/// Lock-free counters shared by one stage's tasks.
#[derive(Debug, Default)]
pub struct StageCounters {
    processed: AtomicU64,
    completed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    reclaimed: AtomicU64,
}

impl StageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self, count: usize) {
        self.reclaimed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StageStats {
        StageStats {
            processed: self.processed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let counters = StageCounters::new();
        counters.record_processed();
        counters.record_processed();
        counters.record_completed();
        counters.record_skipped();
        counters.record_reclaimed(3);

        assert_eq!(
            counters.snapshot(),
            StageStats {
                processed: 2,
                completed: 1,
                skipped: 1,
                failed: 0,
                reclaimed: 3,
            }
        );
    }
}
