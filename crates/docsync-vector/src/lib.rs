//! # docsync-vector
//!
//! Vector store interface for the index stage.
//!
//! The store's indexing and search internals are external; the pipeline
//! only upserts and deletes points by id and reads collection counts.
//!
//! ## Features
//! - [`VectorStore`] trait (ensure_collection, upsert, delete, collection_stats)
//! - [`QdrantStore`]: Qdrant REST client
//! - [`InMemoryVectorStore`]: dimension-checked in-process store

pub mod error;
pub mod memory;
pub mod qdrant;
pub mod store;

pub use error::VectorError;
pub use memory::InMemoryVectorStore;
pub use qdrant::QdrantStore;
pub use store::{CollectionConfig, CollectionStats, Distance, VectorStore};
