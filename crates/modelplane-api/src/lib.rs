//! modelplane-api: REST API server for modelplane
//!
//! This crate provides the REST API for interacting with a modelplane node:
//! - Model register, two-phase upload, deploy, undeploy and predict
//! - Model profiles, routing table and task records
//! - Node-local deploy/undeploy endpoints used by peers

pub mod error;
pub mod rest;

pub use error::ApiError;
pub use rest::create_router;
