//! # docsync-embeddings
//!
//! Embedding provider interface for the enrichment stage.
//!
//! The inference engine itself is external; the pipeline only needs a
//! text -> vector function with a fixed output dimension and a health
//! check.
//!
//! ## Features
//! - [`EmbeddingProvider`] trait (encode, encode_batch, health)
//! - [`HttpEmbeddingClient`] for the `/encode`, `/encode_batch`, `/health` service
//! - [`MockEmbedder`]: deterministic vectors with failure injection for tests

pub mod error;
pub mod http;
pub mod mock;
pub mod provider;

pub use error::EmbeddingError;
pub use http::HttpEmbeddingClient;
pub use mock::MockEmbedder;
pub use provider::{Embedding, EmbeddingProvider, ProviderHealth};
