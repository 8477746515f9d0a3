//! modelplane-runtime: Predictor runtime layer
//!
//! This crate turns a deployed model into an executable predictor:
//! - Remote predictors forwarding to an HTTP endpoint
//! - Process-backed predictors serving a local binary artifact
//! - Built-in algorithm predictors
//! - A handle that releases its predictor exactly once
//! - Input guardrails

pub mod builtin;
pub mod factory;
pub mod guard;
pub mod handle;
pub mod process;
pub mod remote;
pub mod traits;

pub use builtin::KMeansPredictor;
pub use factory::DefaultPredictorFactory;
pub use guard::Guard;
pub use handle::PredictorHandle;
pub use process::{ProcessPredictor, ProcessRuntime, ProcessRuntimeConfig};
pub use remote::RemotePredictor;
pub use traits::{InferenceInput, InferenceOutput, Predictor, PredictorFactory, PredictorSpec};
