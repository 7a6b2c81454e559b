//! In-process vector store.
//!
//! Holds points in a map keyed by id. Used by tests and by hosts that
//! want to run the pipeline without a Qdrant server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use docsync_types::IndexPoint;
use tracing::debug;
use uuid::Uuid;

use crate::error::VectorError;
use crate::store::{CollectionConfig, CollectionStats, VectorStore};

/// Dimension-checked vector store kept in memory.
pub struct InMemoryVectorStore {
    collection: CollectionConfig,
    points: RwLock<HashMap<Uuid, IndexPoint>>,
    created: AtomicBool,
    failures_remaining: AtomicU32,
    mutations: AtomicUsize,
}

impl InMemoryVectorStore {
    pub fn new(collection: CollectionConfig) -> Self {
        Self {
            collection,
            points: RwLock::new(HashMap::new()),
            created: AtomicBool::new(false),
            failures_remaining: AtomicU32::new(0),
            mutations: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` upsert/delete calls fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Whether `ensure_collection` has run.
    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    /// Successful upsert and delete calls so far.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: Uuid) -> Option<IndexPoint> {
        self.points.read().ok()?.get(&id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.points
            .read()
            .map(|points| points.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.points.read().map(|points| points.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_failure(&self) -> Result<(), VectorError> {
        match self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(VectorError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn lock_poisoned() -> VectorError {
        VectorError::Unavailable("point map lock poisoned".to_string())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn collection(&self) -> &CollectionConfig {
        &self.collection
    }

    async fn ensure_collection(&self) -> Result<(), VectorError> {
        self.created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert(&self, point: &IndexPoint) -> Result<(), VectorError> {
        if point.vector.len() != self.collection.dimension {
            return Err(VectorError::DimensionMismatch {
                expected: self.collection.dimension,
                actual: point.vector.len(),
            });
        }
        self.take_failure()?;
        {
            let mut points = self.points.write().map_err(|_| Self::lock_poisoned())?;
            points.insert(point.id, point.clone());
        }
        self.mutations.fetch_add(1, Ordering::SeqCst);
        debug!(point_id = %point.id, "Upserted point in memory");
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), VectorError> {
        self.take_failure()?;
        {
            let mut points = self.points.write().map_err(|_| Self::lock_poisoned())?;
            points.remove(&id);
        }
        self.mutations.fetch_add(1, Ordering::SeqCst);
        debug!(point_id = %id, "Deleted point in memory");
        Ok(())
    }

    async fn collection_stats(&self) -> Result<CollectionStats, VectorError> {
        let points = self.points.read().map_err(|_| Self::lock_poisoned())?;
        Ok(CollectionStats {
            points_count: points.len() as u64,
        })
    }
}
