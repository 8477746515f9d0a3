//! Model lifecycle manager
//!
//! Entry point for register, chunk upload, deploy, undeploy and predict.
//! Multi-document consistency (group version, meta, chunks) comes from
//! compensating rollback, not transactions: every failure after the first
//! write undoes what this call wrote before surfacing the original error.

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use modelplane_core::{
    DeployPlan, FunctionCategory, LifecycleConfig, ModelChunk, ModelGroup, ModelMeta,
    ModelPlaneError, ModelPlaneResult, ModelState, RateLimiterConfig, RegisterMetaInput,
    RegisterModelInput, RemoteTarget, Task, TaskState, TaskType,
};
use modelplane_network::{NodeDeployRequest, NodeDispatcher, NodeUndeployRequest};
use modelplane_runtime::{InferenceInput, InferenceOutput, PredictorFactory, PredictorHandle, PredictorSpec};
use modelplane_store::{chunk, ChunkTransfer, ContentFetcher, ModelRepository};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreakerService;
use crate::cache::{ModelCache, ModelProfile};
use crate::router::WorkerNodeRouter;
use crate::tasks::{RunningTasks, TaskSlot};

/// Attempts at a conditional group update before giving up
const GROUP_UPDATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterOutcome {
    pub model_id: String,
    pub model_group_id: String,
    pub version: u32,
    pub task_id: String,
    pub state: ModelState,
    /// Present when the register request asked for a deploy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMetaOutcome {
    pub model_id: String,
    pub model_group_id: String,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunkOutcome {
    pub model_id: String,
    pub chunk_number: u32,
    pub state: ModelState,
}

/// Cluster-wide deploy request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployModelRequest {
    pub model_id: String,
    /// Empty means every eligible node
    #[serde(default)]
    pub target_nodes: Vec<String>,
}

/// Deploy on this node only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDeployRequest {
    pub model_id: String,
    #[serde(default)]
    pub target_nodes: Vec<String>,
    #[serde(default)]
    pub deploy_to_all_nodes: bool,
    /// Issued by recovery rather than by a caller
    #[serde(default)]
    pub is_auto_deploy: bool,
}

/// Aggregated result of a cluster-wide deploy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub model_id: String,
    pub task_id: String,
    pub state: ModelState,
    pub deployed_nodes: Vec<String>,
    /// Error per node that failed
    pub failures: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UndeployStatus {
    Undeployed,
    NotFound,
    Failed,
}

/// Result of a deploy running in the background; resolves exactly once
pub struct DeployHandle {
    task_id: String,
    receiver: oneshot::Receiver<ModelPlaneResult<DeployOutcome>>,
}

impl DeployHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the outcome, consuming the handle
    pub async fn wait(self) -> ModelPlaneResult<DeployOutcome> {
        self.receiver
            .await
            .map_err(|_| ModelPlaneError::Internal(format!("deploy task {} was dropped", self.task_id)))?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupChange {
    Created,
    Bumped,
}

/// Group version claimed by one register call
#[derive(Debug, Clone)]
struct GroupVersion {
    group_id: String,
    version: u32,
    change: GroupChange,
}

/// Validated deploy ready to fan out
struct PreparedDeploy {
    model_id: String,
    nodes: Vec<String>,
    deploy_to_all_nodes: bool,
    task: Task,
    _slot: TaskSlot,
}

/// A DEPLOYING cache entry that is purged unless the deploy commits.
///
/// Dropping the deploy future partway (client gone, dispatch timeout) drops
/// this guard too, so the entry never outlives its deploy.
struct DeployingEntry<'a> {
    cache: &'a ModelCache,
    model_id: &'a str,
    committed: bool,
}

impl<'a> DeployingEntry<'a> {
    fn new(cache: &'a ModelCache, model_id: &'a str) -> Self {
        Self {
            cache,
            model_id,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for DeployingEntry<'_> {
    fn drop(&mut self) {
        if !self.committed && self.cache.remove_model(self.model_id) {
            warn!(model_id = self.model_id, "Purged unfinished deploy");
        }
    }
}

fn millis_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

pub struct ModelManager {
    config: LifecycleConfig,
    repo: ModelRepository,
    transfer: ChunkTransfer,
    fetcher: ContentFetcher,
    cache: Arc<ModelCache>,
    router: Arc<WorkerNodeRouter>,
    factory: Arc<dyn PredictorFactory>,
    breakers: Arc<CircuitBreakerService>,
    running: Arc<RunningTasks>,
    dispatcher: Option<Arc<dyn NodeDispatcher>>,
    /// Serializes chunk uploads per model
    upload_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ModelManager {
    pub fn new(
        config: LifecycleConfig,
        repo: ModelRepository,
        cache: Arc<ModelCache>,
        router: Arc<WorkerNodeRouter>,
        factory: Arc<dyn PredictorFactory>,
        breakers: Arc<CircuitBreakerService>,
    ) -> Self {
        Self {
            transfer: ChunkTransfer::new(repo.clone(), config.max_model_size),
            fetcher: ContentFetcher::new(config.max_model_size),
            running: RunningTasks::new(&config),
            config,
            repo,
            cache,
            router,
            factory,
            breakers,
            dispatcher: None,
            upload_locks: DashMap::new(),
        }
    }

    /// Reach other nodes through `dispatcher`
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn NodeDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn local_node_id(&self) -> &str {
        &self.router.local_node().id
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub fn router(&self) -> &Arc<WorkerNodeRouter> {
        &self.router
    }

    pub fn repository(&self) -> &ModelRepository {
        &self.repo
    }

    pub async fn get_model(&self, model_id: &str) -> ModelPlaneResult<ModelMeta> {
        self.repo.get_model(model_id).await
    }

    pub async fn get_task(&self, task_id: &str) -> ModelPlaneResult<Task> {
        self.repo.get_task(task_id).await
    }

    // Register

    /// Register a model, persisting its content as chunks when it has any.
    ///
    /// On failure the chunks and meta written by this call are deleted and
    /// the group version bump is reversed.
    pub async fn register(&self, input: RegisterModelInput) -> ModelPlaneResult<RegisterOutcome> {
        self.validate_register(&input).await?;
        self.breakers.ensure_closed()?;
        let slot = self.running.try_acquire(TaskType::RegisterModel)?;

        let model_id = Uuid::new_v4().to_string();
        let mut task = Task::new(TaskType::RegisterModel, Some(model_id.clone()));
        task.state = TaskState::Running;
        task.worker_nodes = vec![self.local_node_id().to_string()];
        self.repo.create_task(&task).await?;

        let group = match self
            .bump_group(input.model_group_id.as_deref(), &input.name)
            .await
        {
            Ok(group) => group,
            Err(e) => {
                self.finish_task(&mut task, Some(&e)).await;
                return Err(e);
            }
        };

        info!(
            model_id = %model_id,
            name = %input.name,
            category = %input.category,
            group_id = %group.group_id,
            version = group.version,
            "Registering model"
        );

        if let Err(e) = self.register_content(&model_id, &group, &input).await {
            error!(model_id = %model_id, error = %e, "Model registration failed, rolling back");
            self.rollback_register(&model_id, &group).await;
            self.finish_task(&mut task, Some(&e)).await;
            return Err(e);
        }
        self.finish_task(&mut task, None).await;
        drop(slot);

        info!(model_id = %model_id, "Model registered");
        let mut outcome = RegisterOutcome {
            model_id: model_id.clone(),
            model_group_id: group.group_id,
            version: group.version,
            task_id: task.id,
            state: ModelState::Registered,
            deploy: None,
            deploy_error: None,
        };

        if input.deploy {
            let request = DeployModelRequest {
                model_id,
                target_nodes: input.target_nodes,
            };
            match self.deploy_model(request).await {
                Ok(deploy) => outcome.deploy = Some(deploy),
                Err(e) => {
                    warn!(model_id = %outcome.model_id, error = %e, "Auto deploy after register failed");
                    outcome.deploy_error = Some(e.to_string());
                }
            }
        }
        Ok(outcome)
    }

    async fn validate_register(&self, input: &RegisterModelInput) -> ModelPlaneResult<()> {
        if input.name.trim().is_empty() {
            return Err(ModelPlaneError::validation("model name is required"));
        }
        if let Some(size) = input.declared_size {
            self.fetcher.check_size(size)?;
        }
        match input.category {
            FunctionCategory::LocalBinary => {
                if input.content.is_none() {
                    return Err(ModelPlaneError::validation(
                        "local binary models need content to register",
                    ));
                }
            }
            FunctionCategory::Remote => match (&input.endpoint, &input.connector_id) {
                (Some(_), _) => {}
                (None, Some(connector_id)) => {
                    self.repo.get_connector(connector_id).await?;
                }
                (None, None) => {
                    return Err(ModelPlaneError::validation(
                        "remote models need an endpoint or a connector",
                    ))
                }
            },
            FunctionCategory::BuiltIn => {
                if input.builtin_params.is_none() {
                    return Err(ModelPlaneError::validation(
                        "built-in models need parameters",
                    ));
                }
            }
        }
        Ok(())
    }

    async fn register_content(
        &self,
        model_id: &str,
        group: &GroupVersion,
        input: &RegisterModelInput,
    ) -> ModelPlaneResult<()> {
        let mut meta = ModelMeta::new(
            model_id.to_string(),
            input.name.clone(),
            group.group_id.clone(),
            input.category,
            group.version,
        );
        meta.format = input.format;
        meta.endpoint = input.endpoint.clone();
        meta.connector_id = input.connector_id.clone();
        meta.builtin_params = input.builtin_params.clone();
        meta.rate_limiter = input.rate_limiter.clone();
        meta.user_rate_limits = input.user_rate_limits.clone();
        meta.guardrails = input.guardrails.clone();
        self.repo.create_model(&meta).await?;

        let mut fields = Map::new();
        if let Some(source) = &input.content {
            let content = self.fetcher.fetch(source).await?;
            let chunk_size = self.config.chunk_size;
            let (digest, size, chunks) = tokio::task::spawn_blocking(move || {
                let digest = chunk::digest(&content);
                let chunks = chunk::split(&content, chunk_size)?;
                Ok::<_, ModelPlaneError>((digest, content.len() as u64, chunks))
            })
            .await
            .map_err(|e| ModelPlaneError::Internal(format!("chunk split task failed: {}", e)))??;

            let total_chunks = self.transfer.upload(model_id, chunks).await?;
            fields.insert("total_chunks".to_string(), json!(total_chunks));
            fields.insert("content_digest".to_string(), json!(digest));
            fields.insert("content_size".to_string(), json!(size));
        }
        fields.insert("last_registered_at".to_string(), json!(Utc::now()));
        self.repo
            .update_model_state(model_id, ModelState::Registered, fields)
            .await
    }

    async fn rollback_register(&self, model_id: &str, group: &GroupVersion) {
        self.transfer.discard(model_id).await;
        if let Err(e) = self.repo.delete_model(model_id).await {
            warn!(model_id = model_id, error = %e, "Failed to delete model meta during rollback");
        }
        self.revert_group(group).await;
    }

    /// Claim the next version of a group, creating the group when none is given
    async fn bump_group(&self, group_id: Option<&str>, name: &str) -> ModelPlaneResult<GroupVersion> {
        match group_id {
            Some(group_id) => {
                let (mut group, token) = self.repo.get_group(group_id).await.map_err(|e| match e {
                    ModelPlaneError::ResourceNotFound(_) => {
                        ModelPlaneError::validation(format!("model group {} does not exist", group_id))
                    }
                    other => other,
                })?;
                group.latest_version += 1;
                group.last_updated_at = Utc::now();
                // A stale token surfaces as a retryable VersionConflict
                self.repo.put_group(&group, token).await?;
                Ok(GroupVersion {
                    group_id: group.id,
                    version: group.latest_version,
                    change: GroupChange::Bumped,
                })
            }
            None => {
                let mut group = ModelGroup::new(Uuid::new_v4().to_string(), name.to_string());
                group.latest_version = 1;
                self.repo.create_group(&group).await?;
                Ok(GroupVersion {
                    group_id: group.id,
                    version: 1,
                    change: GroupChange::Created,
                })
            }
        }
    }

    async fn revert_group(&self, group: &GroupVersion) {
        let result = match group.change {
            GroupChange::Created => self.repo.delete_group(&group.group_id).await.map(|_| ()),
            GroupChange::Bumped => self.decrement_group(&group.group_id).await,
        };
        match result {
            Ok(()) => debug!(group_id = %group.group_id, "Reverted model group version"),
            Err(e) => warn!(group_id = %group.group_id, error = %e, "Failed to revert model group version"),
        }
    }

    async fn decrement_group(&self, group_id: &str) -> ModelPlaneResult<()> {
        for _ in 0..GROUP_UPDATE_ATTEMPTS {
            let (mut group, token) = self.repo.get_group(group_id).await?;
            group.latest_version = group.latest_version.saturating_sub(1);
            group.last_updated_at = Utc::now();
            match self.repo.put_group(&group, token).await {
                Ok(_) => return Ok(()),
                Err(ModelPlaneError::VersionConflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ModelPlaneError::VersionConflict(format!("model group {}", group_id)))
    }

    // Two-phase upload

    /// Declare a local binary model whose chunks are uploaded separately
    pub async fn register_meta(&self, input: RegisterMetaInput) -> ModelPlaneResult<RegisterMetaOutcome> {
        if input.name.trim().is_empty() {
            return Err(ModelPlaneError::validation("model name is required"));
        }
        if input.total_chunks == 0 {
            return Err(ModelPlaneError::validation("total_chunks must be positive"));
        }
        if input.content_digest.is_empty() {
            return Err(ModelPlaneError::validation("content digest is required"));
        }
        self.fetcher.check_size(input.content_size)?;

        let group = self
            .bump_group(input.model_group_id.as_deref(), &input.name)
            .await?;

        let model_id = Uuid::new_v4().to_string();
        let mut meta = ModelMeta::new(
            model_id.clone(),
            input.name,
            group.group_id.clone(),
            FunctionCategory::LocalBinary,
            group.version,
        );
        meta.format = input.format;
        meta.total_chunks = input.total_chunks;
        meta.content_digest = Some(input.content_digest);
        meta.content_size = Some(input.content_size);
        meta.rate_limiter = input.rate_limiter;
        meta.guardrails = input.guardrails;

        if let Err(e) = self.repo.create_model(&meta).await {
            self.revert_group(&group).await;
            return Err(e);
        }
        info!(model_id = %model_id, total_chunks = meta.total_chunks, "Registered model meta");
        Ok(RegisterMetaOutcome {
            model_id,
            model_group_id: group.group_id,
            version: group.version,
        })
    }

    fn upload_lock(&self, model_id: &str) -> Arc<Mutex<()>> {
        self.upload_locks
            .entry(model_id.to_string())
            .or_default()
            .clone()
    }

    /// Persist one chunk of a model declared with [`Self::register_meta`].
    ///
    /// The chunk that completes the model moves it to REGISTERED; before it
    /// is committed the total size is checked against the limit.
    pub async fn upload_chunk(
        &self,
        model_id: &str,
        chunk_number: u32,
        content: Vec<u8>,
    ) -> ModelPlaneResult<UploadChunkOutcome> {
        let lock = self.upload_lock(model_id);
        let _guard = lock.lock().await;

        let meta = self.repo.get_model(model_id).await?;
        if meta.state != ModelState::Registering {
            return Err(ModelPlaneError::validation(format!(
                "model {} is {}, chunks can only be uploaded while REGISTERING",
                model_id, meta.state
            )));
        }
        if chunk_number >= meta.total_chunks {
            return Err(ModelPlaneError::validation(format!(
                "chunk number {} is out of range, model {} has {} chunks",
                chunk_number, model_id, meta.total_chunks
            )));
        }
        if content.is_empty() || content.len() > self.config.chunk_size {
            return Err(ModelPlaneError::validation(format!(
                "chunk size {} must be between 1 and {} bytes",
                content.len(),
                self.config.chunk_size
            )));
        }

        let mut others = Vec::new();
        for number in (0..meta.total_chunks).filter(|n| *n != chunk_number) {
            if self.repo.chunk_exists(model_id, number).await? {
                others.push(number);
            }
        }
        let completes = others.len() as u32 + 1 == meta.total_chunks;

        if completes {
            let mut size = content.len() as u64;
            for number in &others {
                size += self.repo.get_chunk(model_id, *number).await?.content.len() as u64;
            }
            if let Err(e) = self.fetcher.check_size(size) {
                self.abort_upload(&meta).await;
                return Err(e);
            }
        }

        if let Err(e) = self
            .repo
            .put_chunk(&ModelChunk::new(model_id, chunk_number, content))
            .await
        {
            self.abort_upload(&meta).await;
            return Err(e);
        }
        debug!(model_id = model_id, chunk = chunk_number, "Uploaded chunk");

        let state = if completes {
            let mut fields = Map::new();
            fields.insert("last_registered_at".to_string(), json!(Utc::now()));
            if let Err(e) = self
                .repo
                .update_model_state(model_id, ModelState::Registered, fields)
                .await
            {
                self.abort_upload(&meta).await;
                return Err(e);
            }
            self.upload_locks.remove(model_id);
            info!(model_id = model_id, "All chunks uploaded, model registered");
            ModelState::Registered
        } else {
            ModelState::Registering
        };

        Ok(UploadChunkOutcome {
            model_id: model_id.to_string(),
            chunk_number,
            state,
        })
    }

    async fn abort_upload(&self, meta: &ModelMeta) {
        let model_id = meta.id.as_str();
        warn!(model_id = model_id, "Aborting chunk upload, deleting model");
        self.transfer.discard(model_id).await;
        if let Err(e) = self.repo.delete_model(model_id).await {
            warn!(model_id = model_id, error = %e, "Failed to delete model meta");
        }
        self.release_group_version(meta).await;
        self.upload_locks.remove(model_id);
    }

    /// Give back the version an abandoned model claimed, unless a later
    /// registration already moved the group past it
    async fn release_group_version(&self, meta: &ModelMeta) {
        let group = match self.repo.get_group(&meta.model_group_id).await {
            Ok((group, _)) => group,
            Err(e) => {
                warn!(group_id = %meta.model_group_id, error = %e, "Failed to load model group");
                return;
            }
        };
        if group.latest_version != meta.version {
            debug!(
                group_id = %group.id,
                latest_version = group.latest_version,
                version = meta.version,
                "Model group moved on, keeping its version"
            );
            return;
        }
        // Version 1 is only ever claimed by the call that created the group
        let change = if meta.version == 1 {
            GroupChange::Created
        } else {
            GroupChange::Bumped
        };
        self.revert_group(&GroupVersion {
            group_id: group.id,
            version: meta.version,
            change,
        })
        .await;
    }

    // Deploy

    /// Deploy on this node.
    ///
    /// The cache entry ends DEPLOYED or is purged; a partially built predictor
    /// is released with it.
    pub async fn deploy_local(&self, request: LocalDeployRequest) -> ModelPlaneResult<()> {
        let model_id = request.model_id.as_str();

        if !request.is_auto_deploy && self.cache.is_model_deployed(model_id) {
            info!(model_id = model_id, "Model already deployed on this node");
            return self
                .cache
                .set_target_worker_nodes(model_id, &request.target_nodes);
        }

        if self.cache.local_model_count() >= self.config.max_models_per_node {
            return Err(ModelPlaneError::limit_exceeded(format!(
                "exceed max local model per node limit of {}",
                self.config.max_models_per_node
            )));
        }

        let meta = self.repo.get_model(model_id).await?;
        if !meta.state.is_deployable() {
            return Err(ModelPlaneError::validation(format!(
                "model {} is {}, it cannot be deployed yet",
                model_id, meta.state
            )));
        }
        let plan = meta.deploy_plan()?;

        self.cache.init_state(
            model_id,
            ModelState::Deploying,
            meta.category,
            &request.target_nodes,
            request.deploy_to_all_nodes,
        )?;
        let deploying = DeployingEntry::new(&self.cache, model_id);

        info!(
            model_id = model_id,
            category = %meta.category,
            auto = request.is_auto_deploy,
            "Deploying model"
        );
        match self.materialize(&meta, plan).await {
            Ok(()) => {
                deploying.commit();
                info!(model_id = model_id, "Model deployed on this node");
                Ok(())
            }
            Err(e) => {
                drop(deploying);
                error!(model_id = model_id, error = %e, "Failed to deploy model");
                Err(e)
            }
        }
    }

    async fn materialize(&self, meta: &ModelMeta, plan: DeployPlan) -> ModelPlaneResult<()> {
        let model_id = meta.id.as_str();
        let eligible = self.router.eligible_node_count().await.max(1);

        let spec = match plan {
            DeployPlan::Remote(target) => {
                self.configure_admission(meta, meta.user_rate_limits.clone(), eligible)?;
                let endpoint = match target {
                    RemoteTarget::Inline(endpoint) => endpoint,
                    RemoteTarget::Connector(connector_id) => {
                        self.repo.get_connector(&connector_id).await?.endpoint
                    }
                };
                PredictorSpec::Remote { endpoint }
            }
            DeployPlan::LocalBinary {
                total_chunks,
                format,
            } => {
                let mut user_limits = meta.user_rate_limits.clone();
                if let Some(controller) = self.repo.get_controller(model_id).await? {
                    user_limits.extend(controller.user_rate_limits);
                }
                self.configure_admission(meta, user_limits, eligible)?;
                self.breakers.ensure_closed()?;

                let (artifact, digest) = self.transfer.download(model_id, total_chunks).await?;
                let declared = meta.content_digest.as_deref().unwrap_or_default();
                if digest != declared {
                    return Err(ModelPlaneError::Integrity(format!(
                        "model {} content hash {} does not match the declared hash {}",
                        model_id, digest, declared
                    )));
                }
                PredictorSpec::LocalBinary { artifact, format }
            }
            DeployPlan::BuiltIn { params } => {
                self.configure_admission(meta, meta.user_rate_limits.clone(), eligible)?;
                PredictorSpec::BuiltIn { params }
            }
        };

        let predictor = self.factory.create(model_id, spec).await?;
        let handle = Arc::new(PredictorHandle::new(model_id, predictor));
        self.cache.set_predictor(model_id, handle)?;
        self.cache.add_worker_node(model_id, self.local_node_id());
        self.cache.set_state(model_id, ModelState::Deployed)
    }

    fn configure_admission(
        &self,
        meta: &ModelMeta,
        user_limits: HashMap<String, RateLimiterConfig>,
        eligible_nodes: usize,
    ) -> ModelPlaneResult<()> {
        self.cache
            .set_rate_limiters(&meta.id, meta.rate_limiter.clone(), user_limits, eligible_nodes)?;
        self.cache.set_guard(&meta.id, meta.guardrails.as_ref())
    }

    /// Deploy across the cluster and persist the aggregate state
    pub async fn deploy_model(&self, request: DeployModelRequest) -> ModelPlaneResult<DeployOutcome> {
        let prepared = self.prepare_deploy(request).await?;
        self.execute_deploy(prepared).await
    }

    /// Validate and record the deploy, then run it in the background.
    ///
    /// Validation errors are returned directly; the outcome arrives through
    /// the handle.
    pub async fn deploy_in_background(
        self: &Arc<Self>,
        request: DeployModelRequest,
    ) -> ModelPlaneResult<DeployHandle> {
        let prepared = self.prepare_deploy(request).await?;
        let task_id = prepared.task.id.clone();
        let (sender, receiver) = oneshot::channel();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let result = manager.execute_deploy(prepared).await;
            // The caller may have stopped waiting
            let _ = sender.send(result);
        });
        Ok(DeployHandle { task_id, receiver })
    }

    async fn prepare_deploy(&self, request: DeployModelRequest) -> ModelPlaneResult<PreparedDeploy> {
        let meta = self.repo.get_model(&request.model_id).await?;
        if !meta.state.is_deployable() {
            return Err(ModelPlaneError::validation(format!(
                "model {} is {}, it cannot be deployed yet",
                meta.id, meta.state
            )));
        }
        meta.deploy_plan()?;

        let slot = self.running.try_acquire(TaskType::DeployModel)?;
        let nodes = self.router.eligible_nodes(&request.target_nodes).await?;
        let deploy_to_all_nodes = request.target_nodes.is_empty();

        let mut task = Task::new(TaskType::DeployModel, Some(meta.id.clone()));
        task.state = TaskState::Running;
        task.worker_nodes = nodes.clone();
        self.repo.create_task(&task).await?;

        let mut fields = Map::new();
        fields.insert("planning_worker_nodes".to_string(), json!(nodes));
        fields.insert("deploy_to_all_nodes".to_string(), json!(deploy_to_all_nodes));
        if let Err(e) = self
            .repo
            .update_model_state(&meta.id, ModelState::Deploying, fields)
            .await
        {
            self.finish_task(&mut task, Some(&e)).await;
            return Err(e);
        }

        Ok(PreparedDeploy {
            model_id: meta.id,
            nodes,
            deploy_to_all_nodes,
            task,
            _slot: slot,
        })
    }

    async fn execute_deploy(&self, prepared: PreparedDeploy) -> ModelPlaneResult<DeployOutcome> {
        let PreparedDeploy {
            model_id,
            nodes,
            deploy_to_all_nodes,
            mut task,
            _slot,
        } = prepared;

        info!(model_id = %model_id, nodes = ?nodes, task_id = %task.id, "Dispatching deploy");
        let results = join_all(
            nodes
                .iter()
                .map(|node| self.deploy_on(node, &model_id, &nodes, deploy_to_all_nodes)),
        )
        .await;

        let mut deployed_nodes = Vec::new();
        let mut failures = BTreeMap::new();
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok(()) => {
                    self.cache.add_worker_node(&model_id, node);
                    deployed_nodes.push(node.clone());
                }
                Err(e) => {
                    warn!(model_id = %model_id, node_id = %node, error = %e, "Deploy failed on node");
                    failures.insert(node.clone(), e.to_string());
                }
            }
        }

        let state = ModelState::from_deploy_results(deployed_nodes.len(), nodes.len());
        let mut fields = Map::new();
        if !deployed_nodes.is_empty() {
            fields.insert("last_deployed_at".to_string(), json!(Utc::now()));
        }
        if let Err(e) = self.repo.update_model_state(&model_id, state, fields).await {
            self.finish_task(&mut task, Some(&e)).await;
            return Err(e);
        }

        let failure_summary = (!failures.is_empty()).then(|| {
            failures
                .iter()
                .map(|(node, error)| format!("{}: {}", node, error))
                .collect::<Vec<_>>()
                .join("; ")
        });
        if deployed_nodes.is_empty() {
            let e = ModelPlaneError::runtime(failure_summary.unwrap_or_default());
            self.finish_task(&mut task, Some(&e)).await;
        } else {
            task.error = failure_summary;
            self.finish_task(&mut task, None).await;
        }

        info!(model_id = %model_id, state = %state, deployed = deployed_nodes.len(), "Deploy finished");
        Ok(DeployOutcome {
            model_id,
            task_id: task.id,
            state,
            deployed_nodes,
            failures,
        })
    }

    async fn deploy_on(
        &self,
        node_id: &str,
        model_id: &str,
        nodes: &[String],
        deploy_to_all_nodes: bool,
    ) -> ModelPlaneResult<()> {
        if node_id == self.local_node_id() {
            return self
                .deploy_local(LocalDeployRequest {
                    model_id: model_id.to_string(),
                    target_nodes: nodes.to_vec(),
                    deploy_to_all_nodes,
                    is_auto_deploy: false,
                })
                .await;
        }
        let dispatcher = self.dispatcher.as_ref().ok_or_else(|| {
            ModelPlaneError::runtime(format!("no dispatcher configured to reach node {}", node_id))
        })?;
        let request = NodeDeployRequest {
            model_id: model_id.to_string(),
            target_nodes: nodes.to_vec(),
            deploy_to_all_nodes,
        };
        dispatcher.deploy(node_id, &request).await
    }

    // Undeploy

    /// Remove models from this node; an empty list means every local model
    pub fn undeploy_local(&self, model_ids: &[String]) -> BTreeMap<String, UndeployStatus> {
        let model_ids = if model_ids.is_empty() {
            self.cache.local_model_ids()
        } else {
            model_ids.to_vec()
        };

        model_ids
            .into_iter()
            .map(|model_id| {
                let status = if self.cache.state(&model_id).is_some() {
                    UndeployStatus::Undeployed
                } else {
                    UndeployStatus::NotFound
                };
                self.cache.remove_model(&model_id);
                info!(model_id = %model_id, status = ?status, "Undeployed model from this node");
                (model_id, status)
            })
            .collect()
    }

    /// Undeploy models from every node hosting them.
    ///
    /// Returns the status per model and node. A model whose every hosting
    /// node succeeded is persisted as UNDEPLOYED.
    pub async fn undeploy_model(
        &self,
        model_ids: &[String],
    ) -> ModelPlaneResult<BTreeMap<String, BTreeMap<String, UndeployStatus>>> {
        if model_ids.is_empty() {
            return Err(ModelPlaneError::validation("at least one model id is required"));
        }

        let local = self.local_node_id().to_string();
        let mut results = BTreeMap::new();
        for model_id in model_ids {
            let mut per_node = BTreeMap::new();
            let remote_nodes: Vec<String> = self
                .cache
                .worker_nodes(model_id)
                .into_iter()
                .filter(|n| *n != local)
                .collect();

            let local_status = self
                .undeploy_local(std::slice::from_ref(model_id))
                .remove(model_id)
                .unwrap_or(UndeployStatus::NotFound);
            per_node.insert(local.clone(), local_status);

            for node in remote_nodes {
                let status = match &self.dispatcher {
                    Some(dispatcher) => {
                        let request = NodeUndeployRequest {
                            model_ids: vec![model_id.clone()],
                        };
                        match dispatcher.undeploy(&node, &request).await {
                            Ok(()) => {
                                self.cache.remove_worker_node(model_id, &node, true);
                                UndeployStatus::Undeployed
                            }
                            Err(e) => {
                                warn!(model_id = %model_id, node_id = %node, error = %e, "Undeploy failed on node");
                                UndeployStatus::Failed
                            }
                        }
                    }
                    None => UndeployStatus::Failed,
                };
                per_node.insert(node, status);
            }

            if per_node.values().all(|s| *s != UndeployStatus::Failed) {
                match self
                    .repo
                    .update_model_state(model_id, ModelState::Undeployed, Map::new())
                    .await
                {
                    Ok(()) => {}
                    Err(ModelPlaneError::ResourceNotFound(_)) | Err(ModelPlaneError::Validation(_)) => {
                        debug!(model_id = %model_id, "Model meta left unchanged by undeploy")
                    }
                    Err(e) => return Err(e),
                }
            }
            results.insert(model_id.clone(), per_node);
        }
        Ok(results)
    }

    // Predict

    /// Run one prediction on this node
    pub async fn predict(
        &self,
        model_id: &str,
        user: Option<&str>,
        input: InferenceInput,
    ) -> ModelPlaneResult<InferenceOutput> {
        let started = Instant::now();
        let admission = self.cache.admit(model_id, user)?;
        if let Some(guard) = &admission.guard {
            guard.validate(&input.payload)?;
        }

        let inference_started = Instant::now();
        let output = admission.predictor.predict(&input).await?;
        self.cache
            .add_inference_duration(model_id, millis_since(inference_started));
        self.cache
            .add_predict_request_duration(model_id, millis_since(started));
        Ok(output)
    }

    // Observability

    pub fn profile(&self, model_id: &str) -> ModelPlaneResult<ModelProfile> {
        self.cache
            .profile(model_id)
            .ok_or_else(|| ModelPlaneError::not_found(format!("model {} is not in the cache", model_id)))
    }

    pub fn profiles(&self) -> Vec<ModelProfile> {
        self.cache.profiles()
    }

    async fn finish_task(&self, task: &mut Task, error: Option<&ModelPlaneError>) {
        match error {
            Some(e) => {
                task.state = TaskState::Failed;
                task.error = Some(e.to_string());
            }
            None => task.state = TaskState::Completed,
        }
        if let Err(e) = self.repo.update_task(task).await {
            warn!(task_id = %task.id, error = %e, "Failed to persist task state");
        }
    }
}
