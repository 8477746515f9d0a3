//! CLI commands implementation

use anyhow::{Context, Result};
use modelplane_core::{
    ContentSource, Endpoint, FunctionCategory, ModelFormat, ModelMeta, ModelState,
    RegisterMetaInput, RegisterModelInput, Task,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Register response from API
#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    pub model_id: String,
    pub model_group_id: String,
    pub version: u32,
    pub task_id: String,
    pub state: ModelState,
    #[serde(default)]
    pub deploy: Option<DeployResponse>,
    #[serde(default)]
    pub deploy_error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterMetaResponse {
    pub model_id: String,
    pub model_group_id: String,
    pub version: u32,
}

#[derive(Debug, Deserialize)]
pub struct UploadChunkResponse {
    pub chunk_number: u32,
    pub state: ModelState,
}

/// Deploy response from API
#[derive(Debug, Deserialize)]
pub struct DeployResponse {
    pub model_id: String,
    pub task_id: String,
    pub state: ModelState,
    pub deployed_nodes: Vec<String>,
    #[serde(default)]
    pub failures: BTreeMap<String, String>,
}

/// Returned when a deploy runs in the background
#[derive(Debug, Deserialize)]
pub struct DeployAccepted {
    pub task_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct DurationStats {
    pub count: usize,
    pub average: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

/// Per-model profile
#[derive(Debug, Deserialize)]
pub struct ProfileResponse {
    pub model_id: String,
    pub model_state: Option<ModelState>,
    pub predictor: Option<String>,
    pub worker_nodes: Vec<String>,
    pub model_inference_stats: Option<DurationStats>,
    pub predict_request_stats: Option<DurationStats>,
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub node_id: String,
    pub local_models: usize,
    pub eligible_nodes: Vec<String>,
}

/// Flags of the `register` command
pub struct RegisterArgs {
    pub name: String,
    pub category: FunctionCategory,
    pub format: Option<ModelFormat>,
    pub url: Option<String>,
    pub file: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub params: Option<String>,
    pub group: Option<String>,
    pub deploy: bool,
}

impl RegisterArgs {
    pub fn into_input(self) -> Result<RegisterModelInput> {
        let mut input = RegisterModelInput::new(self.name, self.category);
        input.model_group_id = self.group;
        input.format = self.format;
        input.deploy = self.deploy;
        input.content = match (self.url, self.file) {
            (Some(url), _) => Some(ContentSource::Url(url)),
            (None, Some(file)) => Some(ContentSource::File(file)),
            (None, None) => None,
        };
        if let Some(endpoint) = self.endpoint {
            input.endpoint = Some(parse_endpoint(&endpoint)?);
        }
        if let Some(params) = self.params {
            input.builtin_params =
                Some(serde_json::from_str(&params).context("--params is not valid JSON")?);
        }
        Ok(input)
    }
}

/// Parse `host:port`
fn parse_endpoint(value: &str) -> Result<Endpoint> {
    let (host, port) = value
        .rsplit_once(':')
        .with_context(|| format!("endpoint '{}' is not host:port", value))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in endpoint '{}'", value))?;
    Ok(Endpoint::new(host.to_string(), port))
}

/// Turn a non-success response into an error carrying its body
async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error = response.text().await?;
    anyhow::bail!("Failed to {} ({}): {}", action, status, error)
}

/// Register a model
pub async fn register(client: &ApiClient, input: RegisterModelInput) -> Result<()> {
    let response = client
        .client
        .post(client.url("/api/v1/models/_register"))
        .json(&input)
        .send()
        .await?;

    let outcome: RegisterResponse = check(response, "register model").await?.json().await?;
    println!("Model '{}' registered", outcome.model_id);
    println!("  Group: {} (version {})", outcome.model_group_id, outcome.version);
    println!("  Task: {}", outcome.task_id);
    println!("  State: {:?}", outcome.state);
    if let Some(deploy) = &outcome.deploy {
        print_deploy(deploy);
    }
    if let Some(error) = &outcome.deploy_error {
        eprintln!("Deploy failed: {}", error);
    }

    Ok(())
}

/// Declare a model, then upload its chunks one by one
pub async fn upload(
    client: &ApiClient,
    path: &Path,
    name: String,
    format: Option<ModelFormat>,
    group: Option<String>,
    chunk_size: usize,
) -> Result<()> {
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let chunks = modelplane_store::split(&content, chunk_size)?;

    let input = RegisterMetaInput {
        name,
        model_group_id: group,
        format,
        total_chunks: chunks.len() as u32,
        content_digest: modelplane_store::digest(&content),
        content_size: content.len() as u64,
        rate_limiter: None,
        guardrails: None,
    };
    let response = client
        .client
        .post(client.url("/api/v1/models/_register_meta"))
        .json(&input)
        .send()
        .await?;
    let meta: RegisterMetaResponse = check(response, "register model meta").await?.json().await?;
    println!(
        "Model '{}' declared in group {} (version {}), uploading {} chunks",
        meta.model_id,
        meta.model_group_id,
        meta.version,
        chunks.len()
    );

    for (number, chunk) in chunks.into_iter().enumerate() {
        let response = client
            .client
            .post(client.url(&format!("/api/v1/models/{}/chunks/{}", meta.model_id, number)))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(chunk)
            .send()
            .await?;
        let uploaded: UploadChunkResponse = check(response, "upload chunk").await?.json().await?;
        tracing::debug!(chunk = uploaded.chunk_number, state = ?uploaded.state, "Uploaded chunk");
        if uploaded.state == ModelState::Registered {
            println!("Model '{}' registered", meta.model_id);
        }
    }

    Ok(())
}

/// Show a model's meta document
pub async fn get_model(client: &ApiClient, model_id: &str) -> Result<()> {
    let response = client
        .client
        .get(client.url(&format!("/api/v1/models/{}", model_id)))
        .send()
        .await?;

    let meta: ModelMeta = check(response, "get model").await?.json().await?;
    println!("Model: {} ({})", meta.name, meta.id);
    println!("  Group: {} (version {})", meta.model_group_id, meta.version);
    println!("  Category: {}", meta.category);
    println!("  State: {:?}", meta.state);
    if meta.total_chunks > 0 {
        println!("  Chunks: {}", meta.total_chunks);
    }
    if let Some(digest) = &meta.content_digest {
        println!("  Digest: {}", digest);
    }
    if !meta.planning_worker_nodes.is_empty() {
        println!("  Planned nodes: {}", meta.planning_worker_nodes.join(", "));
    }

    Ok(())
}

/// Deploy a model
pub async fn deploy(
    client: &ApiClient,
    model_id: &str,
    target_nodes: Vec<String>,
    wait_for_completion: bool,
) -> Result<()> {
    #[derive(Serialize)]
    struct DeployRequest {
        target_nodes: Vec<String>,
        wait_for_completion: bool,
    }

    let response = client
        .client
        .post(client.url(&format!("/api/v1/models/{}/_deploy", model_id)))
        .json(&DeployRequest {
            target_nodes,
            wait_for_completion,
        })
        .send()
        .await?;
    let response = check(response, "deploy model").await?;

    if wait_for_completion {
        let outcome: DeployResponse = response.json().await?;
        print_deploy(&outcome);
    } else {
        let accepted: DeployAccepted = response.json().await?;
        println!("Deploy task {} {}", accepted.task_id, accepted.status);
        println!("Check progress with: modelplane task {}", accepted.task_id);
    }

    Ok(())
}

/// Undeploy models from every hosting node
pub async fn undeploy(client: &ApiClient, model_ids: Vec<String>) -> Result<()> {
    #[derive(Serialize)]
    struct UndeployRequest {
        model_ids: Vec<String>,
    }

    let response = client
        .client
        .post(client.url("/api/v1/models/_undeploy"))
        .json(&UndeployRequest { model_ids })
        .send()
        .await?;

    let results: BTreeMap<String, BTreeMap<String, String>> =
        check(response, "undeploy models").await?.json().await?;
    for (model, statuses) in results {
        for (node, status) in statuses {
            println!("{:<36} {:<20} {}", model, node, status);
        }
    }

    Ok(())
}

/// Run a prediction and print the payload
pub async fn predict(
    client: &ApiClient,
    model_id: &str,
    input: &str,
    user: Option<String>,
) -> Result<()> {
    #[derive(Serialize)]
    struct PredictRequest {
        user: Option<String>,
        input: serde_json::Value,
    }

    let input = serde_json::from_str(input).context("input is not valid JSON")?;
    let response = client
        .client
        .post(client.url(&format!("/api/v1/models/{}/_predict", model_id)))
        .json(&PredictRequest { user, input })
        .send()
        .await?;

    let output: serde_json::Value = check(response, "predict").await?.json().await?;
    let payload = output.get("payload").unwrap_or(&output);
    println!("{}", serde_json::to_string_pretty(payload)?);

    Ok(())
}

/// Show latency profiles
pub async fn profile(client: &ApiClient, model_id: Option<&str>) -> Result<()> {
    let path = match model_id {
        Some(id) => format!("/api/v1/profile/{}", id),
        None => "/api/v1/profile".to_string(),
    };
    let response = client.client.get(client.url(&path)).send().await?;
    let response = check(response, "get profile").await?;

    let profiles: Vec<ProfileResponse> = match model_id {
        Some(_) => vec![response.json().await?],
        None => response.json().await?,
    };

    if profiles.is_empty() {
        println!("No models on this node");
        return Ok(());
    }

    println!(
        "{:<36} {:<20} {:<12} {:>8} {:>10} {:>10} {:>10}",
        "MODEL", "STATE", "PREDICTOR", "COUNT", "AVG(ms)", "P90(ms)", "P99(ms)"
    );
    println!("{}", "-".repeat(112));
    for profile in profiles {
        let state = profile
            .model_state
            .map(|s| format!("{:?}", s))
            .unwrap_or_else(|| "-".to_string());
        let predictor = profile.predictor.as_deref().unwrap_or("-");
        match &profile.predict_request_stats {
            Some(stats) => println!(
                "{:<36} {:<20} {:<12} {:>8} {:>10.2} {:>10.2} {:>10.2}",
                profile.model_id, state, predictor, stats.count, stats.average, stats.p90, stats.p99
            ),
            None => println!(
                "{:<36} {:<20} {:<12} {:>8}",
                profile.model_id, state, predictor, 0
            ),
        }
        if let Some(stats) = &profile.model_inference_stats {
            println!(
                "  inference: count={} avg={:.2}ms p50={:.2}ms p99={:.2}ms",
                stats.count, stats.average, stats.p50, stats.p99
            );
        }
        if !profile.worker_nodes.is_empty() {
            println!("  nodes: {}", profile.worker_nodes.join(", "));
        }
    }

    Ok(())
}

/// Show which nodes host which models
pub async fn routing(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/routing"))
        .send()
        .await?;

    let table: BTreeMap<String, Vec<String>> =
        check(response, "get routing table").await?.json().await?;
    if table.is_empty() {
        println!("No models deployed");
    } else {
        for (model, nodes) in table {
            println!("{:<36} {}", model, nodes.join(", "));
        }
    }

    Ok(())
}

/// Show a task
pub async fn task(client: &ApiClient, task_id: &str) -> Result<()> {
    let response = client
        .client
        .get(client.url(&format!("/api/v1/tasks/{}", task_id)))
        .send()
        .await?;

    let task: Task = check(response, "get task").await?.json().await?;
    println!("Task: {}", task.id);
    println!("  Type: {:?}", task.task_type);
    println!("  State: {:?}", task.state);
    if let Some(model_id) = &task.model_id {
        println!("  Model: {}", model_id);
    }
    if !task.worker_nodes.is_empty() {
        println!("  Nodes: {}", task.worker_nodes.join(", "));
    }
    if let Some(error) = &task.error {
        println!("  Error: {}", error);
    }
    println!("  Updated: {}", task.last_updated_at);

    Ok(())
}

/// Show node status
pub async fn status(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    let status: StatusResponse = check(response, "get status").await?.json().await?;
    println!("modelplane v{}", status.version);
    println!();
    println!("Node: {}", status.node_id);
    println!("Local models: {}", status.local_models);
    println!("Eligible nodes: {}", status.eligible_nodes.join(", "));

    Ok(())
}

fn print_deploy(outcome: &DeployResponse) {
    println!("Deploy of '{}': {:?}", outcome.model_id, outcome.state);
    println!("  Task: {}", outcome.task_id);
    if !outcome.deployed_nodes.is_empty() {
        println!("  Deployed on: {}", outcome.deployed_nodes.join(", "));
    }
    for (node, error) in &outcome.failures {
        println!("  Failed on {}: {}", node, error);
    }
}
