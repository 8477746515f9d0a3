//! modelplane-store: Model storage
//!
//! This crate provides model storage functionality:
//! - Chunk codec (split, merge, digest)
//! - Content sources for register-by-reference
//! - The document persistence contract and an in-memory backend
//! - Typed repository over models, chunks, groups, tasks and retry records
//! - Sequential chunk transfer

pub mod chunk;
pub mod document;
pub mod memory;
pub mod repository;
pub mod source;
pub mod transfer;

pub use chunk::{digest, merge, split};
pub use document::{ConcurrencyToken, Document, DocumentStore, SearchQuery, SortOrder, WriteResult};
pub use memory::MemoryStore;
pub use repository::ModelRepository;
pub use source::ContentFetcher;
pub use transfer::ChunkTransfer;
