//! Vector store trait and types.

use std::str::FromStr;

use async_trait::async_trait;
use docsync_types::IndexPoint;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::VectorError;

/// Distance metric of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distance {
    Cosine,
    Dot,
    Euclid,
    Manhattan,
}

impl FromStr for Distance {
    type Err = VectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(Distance::Cosine),
            "dot" => Ok(Distance::Dot),
            "euclid" | "euclidean" => Ok(Distance::Euclid),
            "manhattan" => Ok(Distance::Manhattan),
            other => Err(VectorError::Config(format!("unknown distance metric: {other}"))),
        }
    }
}

/// Layout of the target collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionConfig {
    pub name: String,
    pub dimension: usize,
    pub distance: Distance,
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>, dimension: usize, distance: Distance) -> Self {
        Self {
            name: name.into(),
            dimension,
            distance,
        }
    }
}

/// Collection counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionStats {
    pub points_count: u64,
}

/// Fixed-dimension point store keyed by UUID.
///
/// Upsert and delete must be idempotent: repeating either with the same
/// arguments leaves the store unchanged. Deleting an absent point
/// succeeds.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Layout of the collection this store writes to.
    fn collection(&self) -> &CollectionConfig;

    /// Create the collection if it does not exist yet.
    ///
    /// Fails if an existing collection has a different dimension.
    async fn ensure_collection(&self) -> Result<(), VectorError>;

    /// Insert or overwrite the point with `point.id`.
    async fn upsert(&self, point: &IndexPoint) -> Result<(), VectorError>;

    /// Remove the point with `id`, if present.
    async fn delete(&self, id: Uuid) -> Result<(), VectorError>;

    /// Current collection counters.
    async fn collection_stats(&self) -> Result<CollectionStats, VectorError>;
}
