//! REST API handlers

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use modelplane_core::{ModelMeta, RegisterMetaInput, RegisterModelInput, Task};
use modelplane_network::{NodeDeployRequest, NodeUndeployRequest};
use modelplane_runtime::{InferenceInput, InferenceOutput};
use modelplane_scheduler::{
    DeployModelRequest, LocalDeployRequest, ModelManager, ModelProfile, RegisterMetaOutcome,
    RegisterOutcome, UndeployStatus, UploadChunkOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;

/// Largest accepted request body; fits a default-sized chunk
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

type ApiResult<T> = Result<T, ApiError>;

/// Application state shared across handlers
pub struct AppState {
    pub manager: Arc<ModelManager>,
}

/// Create the API router
pub fn create_router(manager: Arc<ModelManager>) -> Router {
    let state = Arc::new(AppState { manager });

    Router::new()
        .route("/api/v1/models/_register", post(register_model))
        .route("/api/v1/models/_register_meta", post(register_meta))
        .route("/api/v1/models/_undeploy", post(undeploy_models))
        .route("/api/v1/models/:id", get(get_model))
        .route("/api/v1/models/:id/chunks/:chunk", post(upload_chunk))
        .route("/api/v1/models/:id/_deploy", post(deploy_model))
        .route("/api/v1/models/:id/_predict", post(predict))
        .route("/api/v1/profile", get(list_profiles))
        .route("/api/v1/profile/:id", get(get_profile))
        .route("/api/v1/routing", get(routing_table))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/status", get(get_status))
        .route("/local/models/_undeploy", post(local_undeploy))
        .route("/local/models/:id/_deploy", post(local_deploy))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Register a model
async fn register_model(
    State(state): State<Arc<AppState>>,
    Json(input): Json<RegisterModelInput>,
) -> ApiResult<Json<RegisterOutcome>> {
    info!(name = %input.name, category = %input.category, "Register request");
    Ok(Json(state.manager.register(input).await?))
}

/// Declare a model whose chunks are uploaded separately
async fn register_meta(
    State(state): State<Arc<AppState>>,
    Json(input): Json<RegisterMetaInput>,
) -> ApiResult<Json<RegisterMetaOutcome>> {
    Ok(Json(state.manager.register_meta(input).await?))
}

/// Upload one raw chunk
async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Path((id, chunk)): Path<(String, u32)>,
    body: Bytes,
) -> ApiResult<Json<UploadChunkOutcome>> {
    Ok(Json(
        state.manager.upload_chunk(&id, chunk, body.to_vec()).await?,
    ))
}

async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ModelMeta>> {
    Ok(Json(state.manager.get_model(&id).await?))
}

/// Body of a deploy request
#[derive(Debug, Deserialize)]
pub struct DeployBody {
    /// Empty means every eligible node
    #[serde(default)]
    pub target_nodes: Vec<String>,
    #[serde(default = "default_wait")]
    pub wait_for_completion: bool,
}

fn default_wait() -> bool {
    true
}

impl Default for DeployBody {
    fn default() -> Self {
        Self {
            target_nodes: Vec::new(),
            wait_for_completion: default_wait(),
        }
    }
}

/// Returned when a deploy runs in the background
#[derive(Debug, Serialize, Deserialize)]
pub struct DeployAccepted {
    pub task_id: String,
    pub status: String,
}

/// Deploy a model across the cluster
async fn deploy_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<DeployBody>>,
) -> ApiResult<Response> {
    let Json(body) = body.unwrap_or_default();
    let request = DeployModelRequest {
        model_id: id,
        target_nodes: body.target_nodes,
    };
    info!(model_id = %request.model_id, wait = body.wait_for_completion, "Deploy request");

    if body.wait_for_completion {
        let outcome = state.manager.deploy_model(request).await?;
        return Ok(Json(outcome).into_response());
    }
    let handle = state.manager.deploy_in_background(request).await?;
    let accepted = DeployAccepted {
        task_id: handle.task_id().to_string(),
        status: "CREATED".to_string(),
    };
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct UndeployBody {
    pub model_ids: Vec<String>,
}

/// Undeploy models from every hosting node
async fn undeploy_models(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UndeployBody>,
) -> ApiResult<Json<BTreeMap<String, BTreeMap<String, UndeployStatus>>>> {
    info!(models = ?body.model_ids, "Undeploy request");
    Ok(Json(state.manager.undeploy_model(&body.model_ids).await?))
}

#[derive(Debug, Deserialize)]
pub struct PredictBody {
    /// Caller identity for per-user throttling
    #[serde(default)]
    pub user: Option<String>,
    pub input: Value,
}

async fn predict(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PredictBody>,
) -> ApiResult<Json<InferenceOutput>> {
    let output = state
        .manager
        .predict(&id, body.user.as_deref(), InferenceInput::new(body.input))
        .await?;
    Ok(Json(output))
}

async fn list_profiles(State(state): State<Arc<AppState>>) -> Json<Vec<ModelProfile>> {
    Json(state.manager.profiles())
}

async fn get_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ModelProfile>> {
    Ok(Json(state.manager.profile(&id)?))
}

async fn routing_table(
    State(state): State<Arc<AppState>>,
) -> Json<BTreeMap<String, BTreeSet<String>>> {
    Json(state.manager.router().routing_table())
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.manager.get_task(&id).await?))
}

/// Node status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub node_id: String,
    pub local_models: usize,
    pub eligible_nodes: Vec<String>,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let manager = &state.manager;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: manager.local_node_id().to_string(),
        local_models: manager.cache().local_model_count(),
        eligible_nodes: manager.router().all_eligible_nodes().await,
    })
}

/// Deploy on this node only; called by the node coordinating a cluster deploy
async fn local_deploy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<NodeDeployRequest>,
) -> ApiResult<StatusCode> {
    state
        .manager
        .deploy_local(LocalDeployRequest {
            model_id: id,
            target_nodes: request.target_nodes,
            deploy_to_all_nodes: request.deploy_to_all_nodes,
            is_auto_deploy: false,
        })
        .await?;
    Ok(StatusCode::OK)
}

async fn local_undeploy(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NodeUndeployRequest>,
) -> Json<BTreeMap<String, UndeployStatus>> {
    Json(state.manager.undeploy_local(&request.model_ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use modelplane_core::{LifecycleConfig, NodeInfo, NodeRole};
    use modelplane_network::{NodeBalancer, StaticMembership};
    use modelplane_runtime::{DefaultPredictorFactory, ProcessRuntimeConfig};
    use modelplane_scheduler::{CircuitBreakerService, ModelCache, WorkerNodeRouter};
    use modelplane_store::{MemoryStore, ModelRepository};
    use serde_json::json;
    use tower::ServiceExt;

    fn app() -> Router {
        let repo = ModelRepository::new(Arc::new(MemoryStore::new()));
        let cache = Arc::new(ModelCache::new(100));
        let membership = Arc::new(StaticMembership::new(NodeInfo::new("n0", [NodeRole::Model])));
        let router = Arc::new(WorkerNodeRouter::new(
            cache.clone(),
            membership,
            NodeBalancer::default(),
            true,
        ));
        let manager = ModelManager::new(
            LifecycleConfig::default(),
            repo,
            cache,
            router,
            Arc::new(DefaultPredictorFactory::new(ProcessRuntimeConfig::default())),
            Arc::new(CircuitBreakerService::empty(false)),
        );
        create_router(Arc::new(manager))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn register_kmeans(app: &Router) -> String {
        let (status, body) = send(
            app,
            "POST",
            "/api/v1/models/_register",
            Some(json!({
                "name": "kmeans",
                "category": "built_in",
                "builtin_params": {"centroids": [[0.0], [10.0]]}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "REGISTERED");
        body["model_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_register_deploy_predict() {
        let app = app();
        let model_id = register_kmeans(&app).await;

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/v1/models/{}/_deploy", model_id),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "DEPLOYED");

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/v1/models/{}/_predict", model_id),
            Some(json!({"input": {"points": [[9.0], [1.0]]}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payload"]["clusters"], json!([1, 0]));

        let (status, body) = send(&app, "GET", &format!("/api/v1/profile/{}", model_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model_state"], "DEPLOYED");
        assert_eq!(body["model_inference_stats"]["count"], 1);

        let (_, body) = send(&app, "GET", "/api/v1/routing", None).await;
        assert_eq!(body[&model_id], json!(["n0"]));
    }

    #[tokio::test]
    async fn test_background_deploy_reports_task() {
        let app = app();
        let model_id = register_kmeans(&app).await;

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/v1/models/{}/_deploy", model_id),
            Some(json!({"wait_for_completion": false})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let task_id = body["task_id"].as_str().unwrap().to_string();

        let mut state = Value::Null;
        for _ in 0..100 {
            let (_, task) = send(&app, "GET", &format!("/api/v1/tasks/{}", task_id), None).await;
            state = task["state"].clone();
            if state == "COMPLETED" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(state, "COMPLETED");
    }

    #[tokio::test]
    async fn test_errors_map_to_status() {
        let app = app();

        let (status, body) = send(&app, "GET", "/api/v1/models/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["retryable"], false);

        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/models/_register",
            Some(json!({
                "name": "huge",
                "category": "local_binary",
                "content": {"url": "http://127.0.0.1:1/model.onnx"},
                "declared_size": 4_831_838_208u64
            })),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/models/missing/_predict",
            Some(json!({"input": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_local_undeploy() {
        let app = app();
        let model_id = register_kmeans(&app).await;
        let (status, _) = send(
            &app,
            "POST",
            &format!("/local/models/{}/_deploy", model_id),
            Some(json!({"model_id": model_id, "target_nodes": ["n0"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            "/local/models/_undeploy",
            Some(json!({"model_ids": [model_id, "other"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[&model_id], "UNDEPLOYED");
        assert_eq!(body["other"], "NOT_FOUND");

        let (_, body) = send(&app, "GET", "/api/v1/status", None).await;
        assert_eq!(body["local_models"], 0);
        assert_eq!(body["node_id"], "n0");
    }
}
