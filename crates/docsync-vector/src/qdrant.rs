//! Qdrant REST client.
//!
//! Talks to the HTTP API directly:
//! - `GET /collections/{name}` for existence, layout and counts
//! - `PUT /collections/{name}` to create the collection
//! - `PUT /collections/{name}/points?wait=true` to upsert
//! - `POST /collections/{name}/points/delete?wait=true` to delete
//!
//! Writes wait for the store to apply the change before returning, so a
//! successful call means the mutation is visible.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use docsync_types::{IndexPoint, PointPayload, VectorStoreSettings};

use crate::error::VectorError;
use crate::store::{CollectionConfig, CollectionStats, Distance, VectorStore};

#[derive(Serialize)]
struct PointStruct<'a> {
    id: Uuid,
    vector: &'a [f32],
    payload: &'a PointPayload,
}

#[derive(Debug, Deserialize)]
struct CollectionResponse {
    result: CollectionInfo,
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    #[serde(default)]
    points_count: Option<u64>,
    #[serde(default)]
    config: Option<CollectionInfoConfig>,
}

#[derive(Debug, Deserialize)]
struct CollectionInfoConfig {
    params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Debug, Deserialize)]
struct VectorParams {
    size: usize,
}

impl CollectionInfo {
    fn dimension(&self) -> Option<usize> {
        self.config.as_ref().map(|c| c.params.vectors.size)
    }
}

/// Vector store backed by a Qdrant server.
#[derive(Debug, Clone)]
pub struct QdrantStore {
    client: Client,
    base_url: String,
    collection: CollectionConfig,
}

impl QdrantStore {
    /// Build a client for the server at `base_url` (e.g. `http://10.0.0.7:6333`).
    pub fn new(
        base_url: impl Into<String>,
        collection: CollectionConfig,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, VectorError> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(VectorError::Config(format!(
                "Qdrant URL must be http(s): {base_url}"
            )));
        }
        if collection.dimension == 0 {
            return Err(VectorError::Config(
                "collection dimension must be > 0".to_string(),
            ));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(key.expose_secret().trim())
                .map_err(|_| VectorError::Config("invalid Qdrant API key".to_string()))?;
            headers.insert("api-key", value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection,
        })
    }

    /// Build a client from the `[vector_store]` settings section.
    pub fn from_settings(settings: &VectorStoreSettings) -> Result<Self, VectorError> {
        let distance: Distance = settings.distance.parse()?;
        Self::new(
            settings.url.clone(),
            CollectionConfig::new(settings.collection.clone(), settings.dimension, distance),
            settings.api_key.clone(),
            Duration::from_secs(settings.timeout_secs),
        )
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection.name)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, VectorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        Err(VectorError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Fetch collection info; `None` when the collection does not exist.
    async fn fetch_collection(&self) -> Result<Option<CollectionInfo>, VectorError> {
        let response = self.client.get(self.collection_url()).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let payload: CollectionResponse = Self::check(response).await?.json().await?;
        Ok(Some(payload.result))
    }

    fn create_body(&self) -> serde_json::Value {
        json!({
            "vectors": {
                "size": self.collection.dimension,
                "distance": self.collection.distance,
            }
        })
    }

    fn upsert_body(point: &IndexPoint) -> serde_json::Value {
        json!({
            "points": [PointStruct {
                id: point.id,
                vector: &point.vector,
                payload: &point.payload,
            }]
        })
    }

    fn delete_body(id: Uuid) -> serde_json::Value {
        json!({ "points": [id] })
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn collection(&self) -> &CollectionConfig {
        &self.collection
    }

    async fn ensure_collection(&self) -> Result<(), VectorError> {
        if let Some(info) = self.fetch_collection().await? {
            if let Some(actual) = info.dimension() {
                if actual != self.collection.dimension {
                    return Err(VectorError::DimensionMismatch {
                        expected: self.collection.dimension,
                        actual,
                    });
                }
            }
            info!(collection = %self.collection.name, "Qdrant collection exists");
            return Ok(());
        }

        let response = self
            .client
            .put(self.collection_url())
            .json(&self.create_body())
            .send()
            .await?;
        Self::check(response).await?;
        info!(
            collection = %self.collection.name,
            dimension = self.collection.dimension,
            distance = ?self.collection.distance,
            "Created Qdrant collection"
        );
        Ok(())
    }

    async fn upsert(&self, point: &IndexPoint) -> Result<(), VectorError> {
        if point.vector.len() != self.collection.dimension {
            return Err(VectorError::DimensionMismatch {
                expected: self.collection.dimension,
                actual: point.vector.len(),
            });
        }
        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&Self::upsert_body(point))
            .send()
            .await?;
        Self::check(response).await?;
        debug!(point_id = %point.id, "Upserted point");
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), VectorError> {
        let response = self
            .client
            .post(format!("{}/points/delete?wait=true", self.collection_url()))
            .json(&Self::delete_body(id))
            .send()
            .await?;
        Self::check(response).await?;
        debug!(point_id = %id, "Deleted point");
        Ok(())
    }

    async fn collection_stats(&self) -> Result<CollectionStats, VectorError> {
        let info = self
            .fetch_collection()
            .await?
            .ok_or_else(|| VectorError::CollectionNotFound(self.collection.name.clone()))?;
        Ok(CollectionStats {
            points_count: info.points_count.unwrap_or(0),
        })
    }
}
