//! Model metadata, chunk, group and lifecycle state definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::{ModelPlaneError, ModelPlaneResult};

/// Lifecycle state of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelState {
    /// Meta document exists, chunks are being written
    Registering,
    /// All declared chunks are persisted
    Registered,
    /// Deploy in progress
    Deploying,
    /// Deployed on every target node
    Deployed,
    /// Deployed on a subset of target nodes
    PartiallyDeployed,
    /// Deploy failed on every target node
    DeployFailed,
    /// Removed from every node
    Undeployed,
}

impl ModelState {
    /// Whether a persisted transition from `self` to `next` is legal.
    ///
    /// States only move forward. Re-deploy out of a settled deploy outcome and
    /// undeploy are the explicit resets.
    pub fn can_transition_to(self, next: ModelState) -> bool {
        use ModelState::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Registering, Registered) => true,
            (Registered, Deploying) => true,
            (Deploying, Deployed | PartiallyDeployed | DeployFailed) => true,
            (Deployed | PartiallyDeployed | DeployFailed | Undeployed, Deploying) => true,
            (PartiallyDeployed, Deployed) => true,
            (Deployed, PartiallyDeployed) => true,
            (Deploying | Deployed | PartiallyDeployed | DeployFailed, Undeployed) => true,
            _ => false,
        }
    }

    /// Whether the model may be handed to deploy
    pub fn is_deployable(self) -> bool {
        !matches!(self, ModelState::Registering)
    }

    /// Aggregate per-node deploy results into a cluster-wide state
    pub fn from_deploy_results(succeeded: usize, targeted: usize) -> ModelState {
        if targeted > 0 && succeeded >= targeted {
            ModelState::Deployed
        } else if succeeded > 0 {
            ModelState::PartiallyDeployed
        } else {
            ModelState::DeployFailed
        }
    }
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelState::Registering => write!(f, "REGISTERING"),
            ModelState::Registered => write!(f, "REGISTERED"),
            ModelState::Deploying => write!(f, "DEPLOYING"),
            ModelState::Deployed => write!(f, "DEPLOYED"),
            ModelState::PartiallyDeployed => write!(f, "PARTIALLY_DEPLOYED"),
            ModelState::DeployFailed => write!(f, "DEPLOY_FAILED"),
            ModelState::Undeployed => write!(f, "UNDEPLOYED"),
        }
    }
}

/// How a model is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionCategory {
    /// Externally hosted endpoint
    Remote,
    /// Chunked binary artifact served by a local process
    LocalBinary,
    /// Built-in algorithm whose parameters live on the meta document
    BuiltIn,
}

impl std::fmt::Display for FunctionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionCategory::Remote => write!(f, "remote"),
            FunctionCategory::LocalBinary => write!(f, "local_binary"),
            FunctionCategory::BuiltIn => write!(f, "built_in"),
        }
    }
}

/// Binary artifact format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    Onnx,
    TorchScript,
    Gguf,
}

impl ModelFormat {
    pub fn file_extension(self) -> &'static str {
        match self {
            ModelFormat::Onnx => "onnx",
            ModelFormat::TorchScript => "pt",
            ModelFormat::Gguf => "gguf",
        }
    }
}

/// Network endpoint of an externally hosted model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Whether TLS is enabled
    #[serde(default)]
    pub tls: bool,
    /// Request path for predictions
    #[serde(default = "default_predict_path")]
    pub path: String,
}

fn default_predict_path() -> String {
    "/predict".to_string()
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            tls: false,
            path: default_predict_path(),
        }
    }

    /// Get the base URL for this endpoint
    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Get the prediction URL for this endpoint
    pub fn predict_url(&self) -> String {
        format!("{}{}", self.url(), self.path)
    }
}

/// Persisted connector describing how to reach a remote model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    pub name: String,
    pub endpoint: Endpoint,
}

/// Admission ceiling: `limit` requests per `unit_secs` seconds, cluster wide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub limit: f64,
    #[serde(default = "default_rate_unit")]
    pub unit_secs: u64,
}

fn default_rate_unit() -> u64 {
    1
}

impl RateLimiterConfig {
    pub fn per_second(limit: f64) -> Self {
        Self { limit, unit_secs: 1 }
    }
}

/// Input/output guardrails
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Inputs containing any of these words (case-insensitive) are rejected
    #[serde(default)]
    pub stop_words: Vec<String>,
}

/// Per-model overrides applied at deploy time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelController {
    pub model_id: String,
    /// User name to rate limiter config
    #[serde(default)]
    pub user_rate_limits: HashMap<String, RateLimiterConfig>,
}

/// Persisted model metadata document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMeta {
    pub id: String,
    pub name: String,
    pub model_group_id: String,
    pub category: FunctionCategory,
    /// Version inside the owning group
    pub version: u32,
    #[serde(default)]
    pub format: Option<ModelFormat>,
    pub state: ModelState,
    #[serde(default)]
    pub total_chunks: u32,
    /// Hex-encoded SHA-256 of the whole content
    #[serde(default)]
    pub content_digest: Option<String>,
    #[serde(default)]
    pub content_size: Option<u64>,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub connector_id: Option<String>,
    #[serde(default)]
    pub builtin_params: Option<serde_json::Value>,
    #[serde(default)]
    pub rate_limiter: Option<RateLimiterConfig>,
    #[serde(default)]
    pub user_rate_limits: HashMap<String, RateLimiterConfig>,
    #[serde(default)]
    pub guardrails: Option<GuardrailConfig>,
    #[serde(default)]
    pub planning_worker_nodes: Vec<String>,
    #[serde(default)]
    pub deploy_to_all_nodes: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_registered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,
}

impl ModelMeta {
    /// Create a meta document in REGISTERING state
    pub fn new(
        id: String,
        name: String,
        model_group_id: String,
        category: FunctionCategory,
        version: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            model_group_id,
            category,
            version,
            format: None,
            state: ModelState::Registering,
            total_chunks: 0,
            content_digest: None,
            content_size: None,
            endpoint: None,
            connector_id: None,
            builtin_params: None,
            rate_limiter: None,
            user_rate_limits: HashMap::new(),
            guardrails: None,
            planning_worker_nodes: Vec::new(),
            deploy_to_all_nodes: false,
            created_at: now,
            last_updated_at: now,
            last_registered_at: None,
            last_deployed_at: None,
        }
    }

    /// Derive the category-specific deploy plan
    pub fn deploy_plan(&self) -> ModelPlaneResult<DeployPlan> {
        match self.category {
            FunctionCategory::Remote => {
                let target = match (&self.endpoint, &self.connector_id) {
                    (Some(endpoint), _) => RemoteTarget::Inline(endpoint.clone()),
                    (None, Some(connector_id)) => RemoteTarget::Connector(connector_id.clone()),
                    (None, None) => {
                        return Err(ModelPlaneError::validation(format!(
                            "remote model {} has neither an endpoint nor a connector",
                            self.id
                        )))
                    }
                };
                Ok(DeployPlan::Remote(target))
            }
            FunctionCategory::LocalBinary => {
                if self.total_chunks == 0 {
                    return Err(ModelPlaneError::validation(format!(
                        "model {} has no persisted chunks",
                        self.id
                    )));
                }
                Ok(DeployPlan::LocalBinary {
                    total_chunks: self.total_chunks,
                    format: self.format.unwrap_or(ModelFormat::Onnx),
                })
            }
            FunctionCategory::BuiltIn => {
                let params = self.builtin_params.clone().ok_or_else(|| {
                    ModelPlaneError::validation(format!(
                        "built-in model {} has no parameters",
                        self.id
                    ))
                })?;
                Ok(DeployPlan::BuiltIn { params })
            }
        }
    }
}

/// Where a remote model's endpoint comes from
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteTarget {
    Inline(Endpoint),
    Connector(String),
}

/// Category-specific deploy strategy
#[derive(Debug, Clone, PartialEq)]
pub enum DeployPlan {
    Remote(RemoteTarget),
    LocalBinary { total_chunks: u32, format: ModelFormat },
    BuiltIn { params: serde_json::Value },
}

/// Persisted chunk document, sibling of its [`ModelMeta`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelChunk {
    pub model_id: String,
    pub chunk_number: u32,
    #[serde(with = "hex::serde")]
    pub content: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl ModelChunk {
    pub fn new(model_id: &str, chunk_number: u32, content: Vec<u8>) -> Self {
        Self {
            model_id: model_id.to_string(),
            chunk_number,
            content,
            created_at: Utc::now(),
        }
    }
}

/// Document id of a chunk: `modelId_chunkNumber`
pub fn chunk_id(model_id: &str, chunk_number: u32) -> String {
    format!("{}_{}", model_id, chunk_number)
}

/// Logical model group owning a version counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelGroup {
    pub id: String,
    pub name: String,
    pub latest_version: u32,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl ModelGroup {
    pub fn new(id: String, name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            latest_version: 0,
            created_at: now,
            last_updated_at: now,
        }
    }
}

/// Where model content comes from during register
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    Url(String),
    File(PathBuf),
    Inline(#[serde(with = "hex::serde")] Vec<u8>),
}

/// Register request: content supplied by reference, or none for remote/built-in models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterModelInput {
    pub name: String,
    #[serde(default)]
    pub model_group_id: Option<String>,
    pub category: FunctionCategory,
    #[serde(default)]
    pub format: Option<ModelFormat>,
    #[serde(default)]
    pub content: Option<ContentSource>,
    /// Size announced by the caller, checked before download
    #[serde(default)]
    pub declared_size: Option<u64>,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub connector_id: Option<String>,
    #[serde(default)]
    pub builtin_params: Option<serde_json::Value>,
    #[serde(default)]
    pub rate_limiter: Option<RateLimiterConfig>,
    #[serde(default)]
    pub user_rate_limits: HashMap<String, RateLimiterConfig>,
    #[serde(default)]
    pub guardrails: Option<GuardrailConfig>,
    /// Trigger a deploy once registered
    #[serde(default)]
    pub deploy: bool,
    #[serde(default)]
    pub target_nodes: Vec<String>,
}

impl RegisterModelInput {
    pub fn new(name: impl Into<String>, category: FunctionCategory) -> Self {
        Self {
            name: name.into(),
            model_group_id: None,
            category,
            format: None,
            content: None,
            declared_size: None,
            endpoint: None,
            connector_id: None,
            builtin_params: None,
            rate_limiter: None,
            user_rate_limits: HashMap::new(),
            guardrails: None,
            deploy: false,
            target_nodes: Vec::new(),
        }
    }
}

/// First phase of a two-phase upload: declare the content, then push chunks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMetaInput {
    pub name: String,
    #[serde(default)]
    pub model_group_id: Option<String>,
    #[serde(default)]
    pub format: Option<ModelFormat>,
    pub total_chunks: u32,
    pub content_digest: String,
    pub content_size: u64,
    #[serde(default)]
    pub rate_limiter: Option<RateLimiterConfig>,
    #[serde(default)]
    pub guardrails: Option<GuardrailConfig>,
}
