//! Predictor trait definitions

use async_trait::async_trait;
use modelplane_core::{Endpoint, ModelFormat, ModelPlaneResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed inference request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceInput {
    pub payload: Value,
}

impl InferenceInput {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }
}

/// Typed inference response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub payload: Value,
}

/// An executable model
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Run one inference
    async fn predict(&self, input: &InferenceInput) -> ModelPlaneResult<InferenceOutput>;

    /// Release everything the predictor holds; called once by its handle
    fn close(&mut self);

    /// Get the predictor kind
    fn name(&self) -> &'static str;
}

/// Everything needed to build a predictor, with the endpoint and artifact
/// already resolved and verified
#[derive(Debug, Clone)]
pub enum PredictorSpec {
    Remote { endpoint: Endpoint },
    LocalBinary { artifact: Vec<u8>, format: ModelFormat },
    BuiltIn { params: Value },
}

impl PredictorSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            PredictorSpec::Remote { .. } => "remote",
            PredictorSpec::LocalBinary { .. } => "local_binary",
            PredictorSpec::BuiltIn { .. } => "built_in",
        }
    }
}

/// Builds predictors for deployed models
#[async_trait]
pub trait PredictorFactory: Send + Sync {
    async fn create(&self, model_id: &str, spec: PredictorSpec) -> ModelPlaneResult<Box<dyn Predictor>>;
}
