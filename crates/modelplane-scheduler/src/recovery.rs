//! Auto-reload after a node restart
//!
//! A restart wipes the node's model cache. The reloader finds the last model
//! this node deployed and deploys it again, bounded by a retry counter that
//! is persisted per node because the reloader restarts with the node.

use modelplane_core::{ModelPlaneResult, RecoveryConfig};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::lifecycle::{LocalDeployRequest, ModelManager};

/// Retry ceiling and delay schedule for re-deploy attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Attempts stop once the persisted counter exceeds this
    pub max_retry_times: u32,
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            max_retry_times: config.max_retry_times,
            base: config.backoff_base(),
            max: config.backoff_max(),
        }
    }

    /// Whether another attempt is allowed after `retry_count` failures
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count <= self.max_retry_times
    }

    /// Delay before the attempt following `retry_count` failures.
    ///
    /// Zero for the first attempt, then `base * 2^(retry_count - 1)` capped at `max`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry_count - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// `delay` scaled by a random factor in `0.5..1.5`
    pub fn jittered(&self, delay: Duration) -> Duration {
        if delay.is_zero() {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * jitter)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

/// What one reload pass did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReloadOutcome {
    Disabled,
    NotModelNode,
    /// No completed deploy task names this node
    NoHistory,
    RetryLimitReached { retry_count: u32 },
    Reloaded { model_id: String },
    Failed {
        model_id: String,
        error: String,
        retry_count: u32,
    },
}

pub struct AutoReloader {
    manager: Arc<ModelManager>,
    policy: BackoffPolicy,
    enabled: bool,
    only_model_nodes: bool,
}

impl AutoReloader {
    pub fn new(manager: Arc<ModelManager>, config: &RecoveryConfig, only_model_nodes: bool) -> Self {
        Self {
            manager,
            policy: BackoffPolicy::from_config(config),
            enabled: config.enabled,
            only_model_nodes,
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Run one reload pass for the local node.
    ///
    /// The retry counter is written after every attempt: reset to zero on
    /// success, incremented on failure.
    pub async fn reload(&self) -> ModelPlaneResult<ReloadOutcome> {
        if !self.enabled {
            return Ok(ReloadOutcome::Disabled);
        }
        let local = self.manager.router().local_node().clone();
        if !local.can_host_models(self.only_model_nodes) {
            return Ok(ReloadOutcome::NotModelNode);
        }

        let repo = self.manager.repository();
        let Some(task) = repo.latest_completed_deploy_task(&local.id).await? else {
            info!(node_id = %local.id, "No deploy history for this node, nothing to reload");
            return Ok(ReloadOutcome::NoHistory);
        };
        let Some(model_id) = task.model_id else {
            warn!(task_id = %task.id, "Deploy task has no model id");
            return Ok(ReloadOutcome::NoHistory);
        };

        let retry_count = repo.get_retry_count(&local.id).await?;
        if !self.policy.allows(retry_count) {
            info!(
                node_id = %local.id,
                retry_count = retry_count,
                max_retry_times = self.policy.max_retry_times,
                "Exceeded max retry times, skipping model reload"
            );
            return Ok(ReloadOutcome::RetryLimitReached { retry_count });
        }

        let delay = self.policy.jittered(self.policy.delay_for(retry_count));
        if !delay.is_zero() {
            info!(model_id = %model_id, delay_ms = delay.as_millis() as u64, "Delaying model reload");
            tokio::time::sleep(delay).await;
        }

        let deploy_to_all_nodes = self
            .manager
            .get_model(&model_id)
            .await
            .map(|meta| meta.deploy_to_all_nodes)
            .unwrap_or(false);
        let request = LocalDeployRequest {
            model_id: model_id.clone(),
            target_nodes: task.worker_nodes,
            deploy_to_all_nodes,
            is_auto_deploy: true,
        };

        let (next_retry, outcome) = match self.manager.deploy_local(request).await {
            Ok(()) => {
                info!(node_id = %local.id, model_id = %model_id, "Reloaded model");
                (0, ReloadOutcome::Reloaded { model_id })
            }
            Err(e) => {
                let next = retry_count.saturating_add(1);
                error!(
                    node_id = %local.id,
                    model_id = %model_id,
                    retry_count = next,
                    error = %e,
                    "Can't reload model"
                );
                (
                    next,
                    ReloadOutcome::Failed {
                        model_id,
                        error: e.to_string(),
                        retry_count: next,
                    },
                )
            }
        };
        repo.save_retry_count(&local.id, next_retry).await?;
        Ok(outcome)
    }

    /// Run a reload pass in the background
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.reload().await {
                Ok(outcome) => info!(outcome = ?outcome, "Model auto reload finished"),
                Err(e) => error!(error = %e, "Model auto reload failed"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerService;
    use crate::cache::ModelCache;
    use crate::router::WorkerNodeRouter;
    use modelplane_core::{
        FunctionCategory, LifecycleConfig, ModelState, NodeInfo, NodeRole, RegisterModelInput,
        Task, TaskState, TaskType,
    };
    use modelplane_network::{NodeBalancer, StaticMembership};
    use modelplane_runtime::{DefaultPredictorFactory, ProcessRuntimeConfig};
    use modelplane_store::{MemoryStore, ModelRepository};
    use serde_json::json;

    fn manager(roles: Vec<NodeRole>) -> Arc<ModelManager> {
        let repo = ModelRepository::new(Arc::new(MemoryStore::new()));
        let cache = Arc::new(ModelCache::new(100));
        let membership = Arc::new(StaticMembership::new(NodeInfo::new("n0", roles)));
        let router = Arc::new(WorkerNodeRouter::new(
            cache.clone(),
            membership,
            NodeBalancer::default(),
            true,
        ));
        Arc::new(ModelManager::new(
            LifecycleConfig::default(),
            repo,
            cache,
            router,
            Arc::new(DefaultPredictorFactory::new(ProcessRuntimeConfig::default())),
            Arc::new(CircuitBreakerService::empty(false)),
        ))
    }

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            enabled: true,
            max_retry_times: 3,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    async fn register_builtin(manager: &ModelManager) -> String {
        let mut input = RegisterModelInput::new("kmeans", FunctionCategory::BuiltIn);
        input.builtin_params = Some(json!({"centroids": [[0.0], [10.0]]}));
        manager.register(input).await.unwrap().model_id
    }

    async fn record_deploy(manager: &ModelManager, model_id: &str) {
        let mut task = Task::new(TaskType::DeployModel, Some(model_id.to_string()));
        task.state = TaskState::Completed;
        task.worker_nodes = vec!["n0".to_string()];
        manager.repository().create_task(&task).await.unwrap();
    }

    #[test]
    fn test_backoff_delays() {
        let policy = BackoffPolicy {
            max_retry_times: 3,
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));

        let jittered = policy.jittered(Duration::from_millis(100));
        assert!(jittered >= Duration::from_millis(50) && jittered <= Duration::from_millis(150));
    }

    #[test]
    fn test_ceiling_is_exclusive() {
        let policy = BackoffPolicy::from_config(&config());
        assert!(policy.allows(0));
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
    }

    #[tokio::test]
    async fn test_disabled_and_non_model_nodes() {
        let disabled = AutoReloader::new(
            manager(vec![NodeRole::Model]),
            &RecoveryConfig {
                enabled: false,
                ..config()
            },
            true,
        );
        assert_eq!(disabled.reload().await.unwrap(), ReloadOutcome::Disabled);

        let data_node = AutoReloader::new(manager(vec![NodeRole::Data]), &config(), true);
        assert_eq!(data_node.reload().await.unwrap(), ReloadOutcome::NotModelNode);
    }

    #[tokio::test]
    async fn test_no_history_is_a_noop() {
        let reloader = AutoReloader::new(manager(vec![NodeRole::Model]), &config(), true);
        assert_eq!(reloader.reload().await.unwrap(), ReloadOutcome::NoHistory);
    }

    #[tokio::test]
    async fn test_retry_limit_skips_deploy() {
        let manager = manager(vec![NodeRole::Model]);
        let model_id = register_builtin(&manager).await;
        record_deploy(&manager, &model_id).await;
        manager.repository().save_retry_count("n0", 5).await.unwrap();

        let reloader = AutoReloader::new(manager.clone(), &config(), true);
        assert_eq!(
            reloader.reload().await.unwrap(),
            ReloadOutcome::RetryLimitReached { retry_count: 5 }
        );
        assert!(!manager.cache().contains(&model_id));
        assert_eq!(manager.repository().get_retry_count("n0").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_successful_reload_resets_counter() {
        let manager = manager(vec![NodeRole::Model]);
        let model_id = register_builtin(&manager).await;
        record_deploy(&manager, &model_id).await;
        manager.repository().save_retry_count("n0", 3).await.unwrap();

        let reloader = AutoReloader::new(manager.clone(), &config(), true);
        assert_eq!(
            reloader.reload().await.unwrap(),
            ReloadOutcome::Reloaded {
                model_id: model_id.clone()
            }
        );
        assert_eq!(manager.cache().state(&model_id), Some(ModelState::Deployed));
        assert_eq!(manager.repository().get_retry_count("n0").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_reload_increments_counter() {
        let manager = manager(vec![NodeRole::Model]);
        record_deploy(&manager, "deleted-model").await;
        manager.repository().save_retry_count("n0", 1).await.unwrap();

        let reloader = AutoReloader::new(manager.clone(), &config(), true);
        let outcome = reloader.reload().await.unwrap();
        assert!(matches!(
            outcome,
            ReloadOutcome::Failed { retry_count: 2, .. }
        ));
        assert_eq!(manager.repository().get_retry_count("n0").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_spawned_reload_runs_in_background() {
        let manager = manager(vec![NodeRole::Model]);
        let model_id = register_builtin(&manager).await;
        record_deploy(&manager, &model_id).await;

        let reloader = Arc::new(AutoReloader::new(manager.clone(), &config(), true));
        reloader.spawn().await.unwrap();
        assert!(manager.cache().is_model_deployed(&model_id));
    }
}
