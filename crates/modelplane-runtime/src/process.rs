//! Process-backed predictors
//!
//! A verified local artifact is written to the work directory and served by
//! an inference server child process. The predictor forwards requests to it
//! and kills it on close.

use async_trait::async_trait;
use modelplane_core::{Endpoint, ModelFormat, ModelPlaneError, ModelPlaneResult, RuntimeConfig};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::remote::post_json;
use crate::traits::{InferenceInput, InferenceOutput, Predictor};

/// Number of ports handed out before wrapping back to the base port
const PORT_RANGE: u16 = 1000;

/// Process runtime configuration
#[derive(Debug, Clone)]
pub struct ProcessRuntimeConfig {
    /// Path to the inference server binary
    pub server_path: PathBuf,
    /// Directory for model artifacts
    pub work_dir: PathBuf,
    /// First port handed to a server process
    pub base_port: u16,
    /// Additional arguments for the server
    pub extra_args: Vec<String>,
    /// Per-request timeout
    pub predict_timeout: Duration,
}

impl Default for ProcessRuntimeConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for ProcessRuntimeConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            server_path: config.server_path.clone(),
            work_dir: config.work_dir.clone(),
            base_port: config.worker_base_port,
            extra_args: Vec::new(),
            predict_timeout: Duration::from_secs(config.predict_timeout_secs),
        }
    }
}

/// Launches inference server processes for local binary models
pub struct ProcessRuntime {
    config: ProcessRuntimeConfig,
    client: reqwest::Client,
    next_port: AtomicU16,
}

impl ProcessRuntime {
    pub fn new(config: ProcessRuntimeConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            next_port: AtomicU16::new(0),
        }
    }

    fn allocate_port(&self) -> u16 {
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % PORT_RANGE;
        self.config.base_port.wrapping_add(offset)
    }

    /// Location of a model's artifact inside the work directory
    pub fn artifact_path(&self, model_id: &str, format: ModelFormat) -> PathBuf {
        let safe_name = model_id.replace(['/', ':'], "_");
        self.config
            .work_dir
            .join(format!("{}.{}", safe_name, format.file_extension()))
    }

    /// Build the command to start a server
    fn build_command(&self, model_path: &Path, port: u16) -> Command {
        let mut cmd = Command::new(&self.config.server_path);

        cmd.arg("--model").arg(model_path);
        cmd.arg("--host").arg("127.0.0.1");
        cmd.arg("--port").arg(port.to_string());

        for arg in &self.config.extra_args {
            cmd.arg(arg);
        }

        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        cmd
    }

    /// Write the artifact and start a server for it
    pub async fn launch(
        &self,
        model_id: &str,
        artifact: &[u8],
        format: ModelFormat,
    ) -> ModelPlaneResult<ProcessPredictor> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let model_path = self.artifact_path(model_id, format);
        tokio::fs::write(&model_path, artifact).await?;

        let port = self.allocate_port();
        info!(
            model_id = model_id,
            path = %model_path.display(),
            port = port,
            "Starting predictor process"
        );

        let child = match self.build_command(&model_path, port).spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(model_id = model_id, error = %e, "Failed to spawn predictor process");
                remove_artifact(&model_path);
                return Err(ModelPlaneError::runtime(format!(
                    "Failed to spawn predictor for {}: {}",
                    model_id, e
                )));
            }
        };
        debug!(model_id = model_id, pid = child.id().unwrap_or(0), "Predictor process spawned");

        let endpoint = Endpoint::new("127.0.0.1".to_string(), port);
        Ok(ProcessPredictor {
            model_id: model_id.to_string(),
            url: endpoint.predict_url(),
            client: self.client.clone(),
            timeout: self.config.predict_timeout,
            child: Some(child),
            model_path,
        })
    }
}

fn remove_artifact(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove model artifact");
        }
    }
}

/// Predictor served by a child process
pub struct ProcessPredictor {
    model_id: String,
    url: String,
    client: reqwest::Client,
    timeout: Duration,
    child: Option<Child>,
    model_path: PathBuf,
}

impl ProcessPredictor {
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

#[async_trait]
impl Predictor for ProcessPredictor {
    async fn predict(&self, input: &InferenceInput) -> ModelPlaneResult<InferenceOutput> {
        post_json(&self.client, &self.url, self.timeout, input).await
    }

    fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!(model_id = %self.model_id, pid = child.id().unwrap_or(0), "Stopping predictor process");
            if let Err(e) = child.start_kill() {
                warn!(model_id = %self.model_id, error = %e, "Failed to kill predictor process");
            }
        }
        remove_artifact(&self.model_path);
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(work_dir: PathBuf, server_path: &str) -> ProcessRuntime {
        let config = ProcessRuntimeConfig {
            server_path: PathBuf::from(server_path),
            work_dir,
            base_port: 31000,
            extra_args: Vec::new(),
            predict_timeout: Duration::from_secs(1),
        };
        ProcessRuntime::new(config, reqwest::Client::new())
    }

    #[test]
    fn test_config_from_runtime_config() {
        let config = ProcessRuntimeConfig::default();
        assert_eq!(config.server_path.to_str().unwrap(), "model-server");
        assert_eq!(config.base_port, 30000);
    }

    #[test]
    fn test_artifact_path_and_ports() {
        let runtime = runtime(PathBuf::from("/var/lib/modelplane/models"), "model-server");
        assert_eq!(
            runtime.artifact_path("org/bert:v1", ModelFormat::Onnx),
            PathBuf::from("/var/lib/modelplane/models/org_bert_v1.onnx")
        );
        assert_eq!(runtime.allocate_port(), 31000);
        assert_eq!(runtime.allocate_port(), 31001);
    }

    #[tokio::test]
    async fn test_spawn_failure_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path().to_path_buf(), "/nonexistent/model-server");

        let result = runtime.launch("m1", b"weights", ModelFormat::Onnx).await;
        assert!(matches!(result, Err(ModelPlaneError::Runtime(_))));
        assert!(!runtime.artifact_path("m1", ModelFormat::Onnx).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_kills_child_and_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        // `true` ignores its arguments and exits
        let runtime = runtime(dir.path().to_path_buf(), "true");

        let mut predictor = runtime
            .launch("m1", b"weights", ModelFormat::Gguf)
            .await
            .unwrap();
        let path = predictor.model_path().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"weights");

        predictor.close();
        assert!(!path.exists());
        assert!(predictor.child.is_none());
    }
}
