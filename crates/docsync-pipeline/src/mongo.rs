//! MongoDB change streams as a [`ChangeFeed`].
//!
//! Each open watches the source collection with full-document lookup, so
//! updates carry the document as it is after the change. Events are
//! handed to [`crate::normalize`] as relaxed extended JSON: ObjectIds
//! arrive as `{"$oid": ...}` and dates as `{"$date": ...}`.

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::change_stream::ChangeStream;
use mongodb::options::FullDocumentType;
use mongodb::{Client, Collection};
use serde_json::Value;
use tracing::info;

use docsync_types::SourceSettings;

use crate::capture::{ChangeFeed, ChangeSubscription};
use crate::error::FeedError;

/// Change feed over one MongoDB collection.
pub struct MongoChangeFeed {
    collection: Collection<Document>,
}

impl MongoChangeFeed {
    /// Connect and verify the server answers before any feed is opened.
    pub async fn connect(settings: &SourceSettings) -> Result<Self, FeedError> {
        let client = Client::with_uri_str(&settings.uri)
            .await
            .map_err(|e| FeedError::Unavailable(e.to_string()))?;
        let database = client.database(&settings.database);
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| FeedError::Unavailable(format!("ping failed: {e}")))?;
        info!(
            database = %settings.database,
            collection = %settings.collection,
            "Connected to MongoDB"
        );
        Ok(Self {
            collection: database.collection(&settings.collection),
        })
    }
}

#[async_trait]
impl ChangeFeed for MongoChangeFeed {
    async fn open(&self) -> Result<Box<dyn ChangeSubscription>, FeedError> {
        let stream = self
            .collection
            .watch()
            .full_document(FullDocumentType::UpdateLookup)
            .await
            .map_err(|e| FeedError::Unavailable(e.to_string()))?;
        Ok(Box::new(MongoSubscription {
            stream: stream.with_type::<Document>(),
        }))
    }
}

struct MongoSubscription {
    stream: ChangeStream<Document>,
}

#[async_trait]
impl ChangeSubscription for MongoSubscription {
    async fn next_change(&mut self) -> Result<Option<Value>, FeedError> {
        match self.stream.next().await {
            Some(Ok(event)) => Ok(Some(to_notification(event))),
            Some(Err(e)) => Err(FeedError::Disconnected(e.to_string())),
            // A change stream only ends when invalidated; capture reopens it.
            None => Err(FeedError::Disconnected("change stream ended".to_string())),
        }
    }
}

/// Change event as relaxed extended JSON.
pub fn to_notification(event: Document) -> Value {
    Bson::Document(event).into_relaxed_extjson()
}
