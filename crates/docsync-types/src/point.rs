//! Index point identity and payload.
//!
//! Every event concerning a `doc_id` targets the same point:
//! `point_id = UUIDv5(POINT_NAMESPACE, doc_id)`. This mapping is pure and
//! must stay byte-for-byte stable, since it is what makes upserts and
//! deletes idempotent under redelivery.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{content_preview, EmbeddedDocument};

/// Namespace for point ids (the RFC 4122 DNS namespace,
/// `6ba7b810-9dad-11d1-80b4-00c04fd430c8`).
pub const POINT_NAMESPACE: Uuid = Uuid::NAMESPACE_DNS;

/// Derive the vector-store point id for a source document id.
pub fn point_id(doc_id: &str) -> Uuid {
    Uuid::new_v5(&POINT_NAMESPACE, doc_id.as_bytes())
}

/// Denormalized metadata stored alongside each vector.
///
/// Carries enough of the source document to inspect results without a
/// join back to the source database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointPayload {
    pub doc_id: String,
    pub product: String,
    pub customer: String,
    pub owner: String,
    pub date: String,
    pub subject: String,
    pub content: String,
    pub content_preview: String,
    pub vector_size: usize,
    pub embedded_timestamp: String,
    pub original_timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<String>,
}

/// A point as stored in the vector store.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

impl IndexPoint {
    /// Build the point for an embedded document.
    pub fn from_document(doc: &EmbeddedDocument) -> Self {
        let fields = &doc.document;
        Self {
            id: point_id(&doc.doc_id),
            vector: doc.vector.clone(),
            payload: PointPayload {
                doc_id: doc.doc_id.clone(),
                product: fields.product.clone(),
                customer: fields.customer.clone(),
                owner: fields.owner.clone(),
                date: fields.date.clone(),
                subject: fields.subject.clone(),
                content: fields.content.clone(),
                content_preview: content_preview(&fields.content),
                vector_size: doc.vector.len(),
                embedded_timestamp: doc.embedded_timestamp.to_rfc3339(),
                original_timestamp: doc.original_timestamp.to_rfc3339(),
                source_message_id: doc.source_message_id.clone(),
            },
        }
    }
}
