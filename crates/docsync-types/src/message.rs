//! Stage message schemas and their wire encoding.
//!
//! Both durable logs store flat string maps (`StreamFields`). Stage-1
//! carries raw change events; Stage-2 carries embedded documents or
//! delete tombstones. Messages are immutable once appended.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::SyncError;
use crate::event::{ChangeEvent, DocumentFields, Operation};

/// Flat field map stored as a single log entry
pub type StreamFields = BTreeMap<String, String>;

/// Stage marker for Stage-1 messages
pub const STAGE_RAW: &str = "raw";

/// Stage marker for Stage-2 messages
pub const STAGE_EMBEDDED: &str = "embedded";

/// Number of characters kept in `content_preview`
pub const CONTENT_PREVIEW_CHARS: usize = 500;

const DOCUMENT_KEYS: [&str; 6] = ["product", "customer", "owner", "date", "subject", "content"];

fn required<'a>(fields: &'a StreamFields, key: &'static str) -> Result<&'a str, SyncError> {
    match fields.get(key) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(SyncError::MissingField(key)),
    }
}

fn optional(fields: &StreamFields, key: &str) -> String {
    fields.get(key).cloned().unwrap_or_default()
}

fn check_stage(fields: &StreamFields, expected: &str) -> Result<(), SyncError> {
    match fields.get("stage") {
        Some(stage) if stage != expected => Err(SyncError::invalid(
            "stage",
            format!("expected {expected}, got {stage}"),
        )),
        _ => Ok(()),
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse an RFC 3339 timestamp; offset-less ISO timestamps are read as UTC.
fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, SyncError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| SyncError::invalid(field, e.to_string()))
}

fn insert_document(fields: &mut StreamFields, doc: &DocumentFields) {
    let values = [
        &doc.product,
        &doc.customer,
        &doc.owner,
        &doc.date,
        &doc.subject,
        &doc.content,
    ];
    for (key, value) in DOCUMENT_KEYS.into_iter().zip(values) {
        fields.insert(key.to_string(), value.clone());
    }
}

fn read_document(fields: &StreamFields) -> DocumentFields {
    DocumentFields {
        product: optional(fields, "product"),
        customer: optional(fields, "customer"),
        owner: optional(fields, "owner"),
        date: optional(fields, "date"),
        subject: optional(fields, "subject"),
        content: optional(fields, "content"),
    }
}

/// Truncate content to the preview length on a character boundary.
pub fn content_preview(content: &str) -> String {
    content.chars().take(CONTENT_PREVIEW_CHARS).collect()
}

/// Stage-1 message: a change event tagged `stage = "raw"`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    event: ChangeEvent,
}

impl RawMessage {
    pub fn new(event: ChangeEvent) -> Self {
        Self { event }
    }

    pub fn event(&self) -> &ChangeEvent {
        &self.event
    }

    pub fn into_event(self) -> ChangeEvent {
        self.event
    }

    /// Encode to the Stage-1 wire schema.
    ///
    /// Deletes carry only `operation`, `doc_id`, `timestamp` and `stage`.
    pub fn to_fields(&self) -> StreamFields {
        let mut fields = StreamFields::new();
        fields.insert("operation".into(), self.event.operation.to_string());
        fields.insert("doc_id".into(), self.event.doc_id.clone());
        fields.insert(
            "timestamp".into(),
            format_timestamp(&self.event.source_timestamp),
        );
        fields.insert("stage".into(), STAGE_RAW.into());
        if let Some(doc) = &self.event.document {
            insert_document(&mut fields, doc);
        }
        fields
    }

    /// Decode from the Stage-1 wire schema.
    pub fn from_fields(fields: &StreamFields) -> Result<Self, SyncError> {
        check_stage(fields, STAGE_RAW)?;
        let operation: Operation = required(fields, "operation")?.parse()?;
        let doc_id = required(fields, "doc_id")?.to_string();
        let source_timestamp = parse_timestamp("timestamp", required(fields, "timestamp")?)?;
        let document = operation.carries_document().then(|| read_document(fields));

        Ok(Self::new(ChangeEvent {
            operation,
            doc_id,
            document,
            source_timestamp,
        }))
    }
}

/// Stage-2 insert/update payload: the raw document plus its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedDocument {
    /// Insert or update
    pub operation: Operation,
    pub doc_id: String,
    pub document: DocumentFields,
    /// Embedding of `document.embedding_text()`
    pub vector: Vec<f32>,
    /// When the embedding was produced
    pub embedded_timestamp: DateTime<Utc>,
    /// Back-reference to the Stage-1 timestamp
    pub original_timestamp: DateTime<Utc>,
    /// Stage-1 message id this was derived from
    pub source_message_id: Option<String>,
}

impl EmbeddedDocument {
    pub fn vector_size(&self) -> usize {
        self.vector.len()
    }
}

/// Stage-2 delete marker carrying only the document identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Tombstone {
    pub doc_id: String,
    pub embedded_timestamp: DateTime<Utc>,
    pub original_timestamp: DateTime<Utc>,
    pub source_message_id: Option<String>,
}

/// Stage-2 message.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddedMessage {
    Document(EmbeddedDocument),
    Tombstone(Tombstone),
}

impl EmbeddedMessage {
    /// Build the Stage-2 message for an insert/update event and its vector.
    pub fn embedded(
        event: &ChangeEvent,
        vector: Vec<f32>,
        source_message_id: Option<String>,
    ) -> Self {
        EmbeddedMessage::Document(EmbeddedDocument {
            operation: event.operation,
            doc_id: event.doc_id.clone(),
            document: event.document.clone().unwrap_or_default(),
            vector,
            embedded_timestamp: Utc::now(),
            original_timestamp: event.source_timestamp,
            source_message_id,
        })
    }

    /// Build the tombstone forwarded for a delete event.
    pub fn tombstone(event: &ChangeEvent, source_message_id: Option<String>) -> Self {
        EmbeddedMessage::Tombstone(Tombstone {
            doc_id: event.doc_id.clone(),
            embedded_timestamp: Utc::now(),
            original_timestamp: event.source_timestamp,
            source_message_id,
        })
    }

    pub fn doc_id(&self) -> &str {
        match self {
            EmbeddedMessage::Document(doc) => &doc.doc_id,
            EmbeddedMessage::Tombstone(tomb) => &tomb.doc_id,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            EmbeddedMessage::Document(doc) => doc.operation,
            EmbeddedMessage::Tombstone(_) => Operation::Delete,
        }
    }

    /// Encode to the Stage-2 wire schema.
    ///
    /// The vector is serialized as a JSON array string.
    pub fn to_fields(&self) -> Result<StreamFields, SyncError> {
        let mut fields = StreamFields::new();
        fields.insert("operation".into(), self.operation().to_string());
        fields.insert("doc_id".into(), self.doc_id().to_string());
        fields.insert("stage".into(), STAGE_EMBEDDED.into());

        let (embedded, original, source) = match self {
            EmbeddedMessage::Document(doc) => {
                insert_document(&mut fields, &doc.document);
                fields.insert(
                    "content_preview".into(),
                    content_preview(&doc.document.content),
                );
                fields.insert("vector".into(), serde_json::to_string(&doc.vector)?);
                fields.insert("vector_size".into(), doc.vector.len().to_string());
                (
                    &doc.embedded_timestamp,
                    &doc.original_timestamp,
                    &doc.source_message_id,
                )
            }
            EmbeddedMessage::Tombstone(tomb) => (
                &tomb.embedded_timestamp,
                &tomb.original_timestamp,
                &tomb.source_message_id,
            ),
        };

        fields.insert("timestamp".into(), format_timestamp(embedded));
        fields.insert("original_timestamp".into(), format_timestamp(original));
        if let Some(id) = source {
            fields.insert("source_message_id".into(), id.clone());
        }
        Ok(fields)
    }

    /// Decode from the Stage-2 wire schema.
    ///
    /// A missing or unparsable vector on an insert/update is an error; the
    /// length is not checked here.
    pub fn from_fields(fields: &StreamFields) -> Result<Self, SyncError> {
        check_stage(fields, STAGE_EMBEDDED)?;
        let operation: Operation = required(fields, "operation")?.parse()?;
        let doc_id = required(fields, "doc_id")?.to_string();
        let embedded_timestamp = parse_timestamp("timestamp", required(fields, "timestamp")?)?;
        let original_timestamp = match fields.get("original_timestamp") {
            Some(value) if !value.is_empty() => parse_timestamp("original_timestamp", value)?,
            _ => embedded_timestamp,
        };
        let source_message_id = fields.get("source_message_id").cloned();

        if !operation.carries_document() {
            return Ok(EmbeddedMessage::Tombstone(Tombstone {
                doc_id,
                embedded_timestamp,
                original_timestamp,
                source_message_id,
            }));
        }

        let vector: Vec<f32> = serde_json::from_str(required(fields, "vector")?)
            .map_err(|e| SyncError::invalid("vector", e.to_string()))?;

        Ok(EmbeddedMessage::Document(EmbeddedDocument {
            operation,
            doc_id,
            document: read_document(fields),
            vector,
            embedded_timestamp,
            original_timestamp,
            source_message_id,
        }))
    }
}
