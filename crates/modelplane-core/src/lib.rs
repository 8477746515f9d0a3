//! modelplane-core: Core types for the modelplane control plane
//!
//! This crate provides the fundamental types used throughout the system:
//! - Model metadata, chunks, groups and lifecycle states
//! - Task and retry records
//! - Cluster node descriptors
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod model;
pub mod node;
pub mod task;

pub use config::*;
pub use error::*;
pub use model::*;
pub use node::*;
pub use task::*;
