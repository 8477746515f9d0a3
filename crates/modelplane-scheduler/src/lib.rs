//! modelplane-scheduler: Model placement and lifecycle for modelplane
//!
//! This crate provides the node-local control plane:
//! - The model cache (state, predictor ownership, worker nodes, limiters, stats)
//! - Token-bucket throttles, circuit breakers and running-task limits
//! - Worker node routing driven by cluster membership
//! - The model lifecycle manager (register, upload, deploy, undeploy, predict)
//! - Auto-reload recovery after a node restart

pub mod breaker;
pub mod cache;
pub mod lifecycle;
pub mod recovery;
pub mod router;
pub mod stats;
pub mod tasks;
pub mod throttle;

pub use breaker::{CircuitBreaker, CircuitBreakerService, MemoryCircuitBreaker};
pub use cache::{ModelCache, ModelProfile};
pub use lifecycle::{
    DeployHandle, DeployModelRequest, DeployOutcome, LocalDeployRequest, ModelManager,
    RegisterMetaOutcome, RegisterOutcome, UndeployStatus, UploadChunkOutcome,
};
pub use recovery::{AutoReloader, BackoffPolicy, ReloadOutcome};
pub use router::WorkerNodeRouter;
pub use stats::{DurationSamples, DurationStats};
pub use tasks::{RunningTasks, TaskSlot};
pub use throttle::{RateLimiter, TokenBucket};
