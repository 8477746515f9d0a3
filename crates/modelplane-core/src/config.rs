//! Configuration types for modelplane

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::node::NodeRole;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Identity and capabilities of this node
    pub node: NodeConfig,
    /// Register/deploy limits
    pub lifecycle: LifecycleConfig,
    /// Inference statistics configuration
    pub monitoring: MonitoringConfig,
    /// Resource-pressure guard configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Auto-reload configuration
    pub recovery: RecoveryConfig,
    /// Local predictor runtime configuration
    pub runtime: RuntimeConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::ModelPlaneError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::ModelPlaneError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::ModelPlaneError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub rest_address: String,
    /// Port for the REST API server
    pub rest_port: u16,
    /// Enable CORS
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rest_address: "0.0.0.0".to_string(),
            rest_port: 9200,
            cors_enabled: true,
        }
    }
}

/// Identity of the local node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node id, used as the recovery key across restarts
    pub id: String,
    /// Capability tags
    pub roles: Vec<NodeRole>,
    /// Other cluster members known at startup
    pub peers: Vec<PeerConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "node-0".to_string(),
            roles: vec![NodeRole::Model, NodeRole::Data],
            peers: Vec::new(),
        }
    }
}

/// A remote cluster member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Node id
    pub id: String,
    /// Base URL of the node's REST API
    pub address: String,
    /// Capability tags
    #[serde(default = "default_peer_roles")]
    pub roles: Vec<NodeRole>,
}

fn default_peer_roles() -> Vec<NodeRole> {
    vec![NodeRole::Model, NodeRole::Data]
}

/// Limits applied by the lifecycle manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Size of each persisted chunk in bytes
    pub chunk_size: usize,
    /// Maximum model content size in bytes
    pub max_model_size: u64,
    /// Maximum number of models deployed on one node
    pub max_models_per_node: usize,
    /// Maximum concurrent register tasks on one node
    pub max_register_tasks_per_node: usize,
    /// Maximum concurrent deploy tasks on one node
    pub max_deploy_tasks_per_node: usize,
    /// Only nodes tagged `model` may host models
    pub only_run_on_model_nodes: bool,
}

/// 4 GiB
pub const DEFAULT_MAX_MODEL_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// 10 MB
pub const DEFAULT_CHUNK_SIZE: usize = 10_000_000;

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_model_size: DEFAULT_MAX_MODEL_SIZE,
            max_models_per_node: 10,
            max_register_tasks_per_node: 10,
            max_deploy_tasks_per_node: 10,
            only_run_on_model_nodes: true,
        }
    }
}

/// Inference statistics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Maximum samples kept per model and per statistic
    pub max_samples: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { max_samples: 10_000 }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable resource-pressure checks
    pub enabled: bool,
    /// Memory usage percentage above which the breaker opens
    pub memory_threshold_percent: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_threshold_percent: 85.0,
        }
    }
}

/// Auto-reload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Re-deploy models previously hosted on this node at startup
    pub enabled: bool,
    /// Persisted retry counter ceiling
    pub max_retry_times: u32,
    /// Base delay before a re-deploy attempt, doubled per recorded retry
    pub backoff_base_ms: u64,
    /// Upper bound on the re-deploy delay
    pub backoff_max_ms: u64,
}

impl RecoveryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retry_times: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

/// Local predictor runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Path to the inference server binary used for local binary models
    pub server_path: PathBuf,
    /// Base port for predictor processes
    pub worker_base_port: u16,
    /// Directory for reassembled model artifacts
    pub work_dir: PathBuf,
    /// Timeout for a single prediction call in seconds
    pub predict_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server_path: PathBuf::from("model-server"),
            worker_base_port: 30000,
            work_dir: PathBuf::from("/var/lib/modelplane/models"),
            predict_timeout_secs: 30,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
