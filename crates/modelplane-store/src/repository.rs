//! Typed access to the persisted control-plane documents

use chrono::Utc;
use modelplane_core::{
    chunk_id, Connector, ModelChunk, ModelController, ModelGroup, ModelMeta, ModelPlaneError,
    ModelPlaneResult, ModelState, RetryRecord, Task, TaskState, TaskType,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::document::{ConcurrencyToken, Document, DocumentStore, SearchQuery, SortOrder};

/// Model meta documents and their chunk siblings
pub const MODEL_INDEX: &str = "models";
pub const MODEL_GROUP_INDEX: &str = "model_groups";
pub const TASK_INDEX: &str = "tasks";
/// Auto-reload retry counters keyed by node id
pub const MODEL_RELOAD_INDEX: &str = "model_reload";
pub const CONNECTOR_INDEX: &str = "connectors";
pub const CONTROLLER_INDEX: &str = "model_controllers";

fn encode<T: Serialize>(value: &T) -> ModelPlaneResult<Value> {
    Ok(serde_json::to_value(value)?)
}

fn decode<T: DeserializeOwned>(doc: Document) -> ModelPlaneResult<T> {
    Ok(serde_json::from_value(doc.source)?)
}

/// Repository over a [`DocumentStore`]
#[derive(Clone)]
pub struct ModelRepository {
    store: Arc<dyn DocumentStore>,
}

impl ModelRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Underlying document store
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    // Models

    pub async fn get_model(&self, model_id: &str) -> ModelPlaneResult<ModelMeta> {
        let doc = self
            .store
            .get(MODEL_INDEX, model_id)
            .await?
            .ok_or_else(|| ModelPlaneError::not_found(format!("model {}", model_id)))?;
        decode(doc)
    }

    pub async fn create_model(&self, meta: &ModelMeta) -> ModelPlaneResult<()> {
        self.store
            .create(MODEL_INDEX, &meta.id, encode(meta)?)
            .await?;
        debug!(model_id = %meta.id, version = meta.version, "Persisted model meta");
        Ok(())
    }

    /// Merge fields into a model meta, stamping `last_updated_at`
    pub async fn update_model_fields(
        &self,
        model_id: &str,
        mut fields: Map<String, Value>,
    ) -> ModelPlaneResult<()> {
        fields.insert("last_updated_at".to_string(), encode(&Utc::now())?);
        self.store.update(MODEL_INDEX, model_id, fields, None).await?;
        Ok(())
    }

    /// Move a persisted model to `next`, refusing backward transitions
    pub async fn update_model_state(
        &self,
        model_id: &str,
        next: ModelState,
        extra: Map<String, Value>,
    ) -> ModelPlaneResult<()> {
        let current = self.get_model(model_id).await?.state;
        if !current.can_transition_to(next) {
            return Err(ModelPlaneError::validation(format!(
                "model {} cannot move from {} to {}",
                model_id, current, next
            )));
        }
        let mut fields = extra;
        fields.insert("state".to_string(), encode(&next)?);
        self.update_model_fields(model_id, fields).await
    }

    pub async fn delete_model(&self, model_id: &str) -> ModelPlaneResult<bool> {
        self.store.delete(MODEL_INDEX, model_id).await
    }

    // Chunks

    pub async fn put_chunk(&self, chunk: &ModelChunk) -> ModelPlaneResult<()> {
        let id = chunk_id(&chunk.model_id, chunk.chunk_number);
        self.store.put(MODEL_INDEX, &id, encode(chunk)?, None).await?;
        Ok(())
    }

    pub async fn get_chunk(&self, model_id: &str, chunk_number: u32) -> ModelPlaneResult<ModelChunk> {
        let id = chunk_id(model_id, chunk_number);
        let doc = self
            .store
            .get(MODEL_INDEX, &id)
            .await?
            .ok_or_else(|| ModelPlaneError::not_found(format!("model chunk {}", id)))?;
        decode(doc)
    }

    pub async fn chunk_exists(&self, model_id: &str, chunk_number: u32) -> ModelPlaneResult<bool> {
        self.store
            .exists(MODEL_INDEX, &chunk_id(model_id, chunk_number))
            .await
    }

    /// Delete every chunk of a model; returns how many were removed
    pub async fn delete_chunks(&self, model_id: &str) -> ModelPlaneResult<u64> {
        self.store
            .delete_by_term(MODEL_INDEX, "model_id", json!(model_id))
            .await
    }

    // Groups

    /// Get a group with the token needed for a conditional update
    pub async fn get_group(&self, group_id: &str) -> ModelPlaneResult<(ModelGroup, ConcurrencyToken)> {
        let doc = self
            .store
            .get(MODEL_GROUP_INDEX, group_id)
            .await?
            .ok_or_else(|| ModelPlaneError::not_found(format!("model group {}", group_id)))?;
        let token = doc.token;
        Ok((decode(doc)?, token))
    }

    pub async fn create_group(&self, group: &ModelGroup) -> ModelPlaneResult<ConcurrencyToken> {
        let result = self
            .store
            .create(MODEL_GROUP_INDEX, &group.id, encode(group)?)
            .await?;
        Ok(result.token)
    }

    /// Replace a group only if it still carries `token`
    pub async fn put_group(
        &self,
        group: &ModelGroup,
        token: ConcurrencyToken,
    ) -> ModelPlaneResult<ConcurrencyToken> {
        let result = self
            .store
            .put(MODEL_GROUP_INDEX, &group.id, encode(group)?, Some(token))
            .await?;
        Ok(result.token)
    }

    pub async fn delete_group(&self, group_id: &str) -> ModelPlaneResult<bool> {
        self.store.delete(MODEL_GROUP_INDEX, group_id).await
    }

    // Tasks

    pub async fn create_task(&self, task: &Task) -> ModelPlaneResult<()> {
        self.store.create(TASK_INDEX, &task.id, encode(task)?).await?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> ModelPlaneResult<Task> {
        let doc = self
            .store
            .get(TASK_INDEX, task_id)
            .await?
            .ok_or_else(|| ModelPlaneError::not_found(format!("task {}", task_id)))?;
        decode(doc)
    }

    /// Persist a task unless the stored copy is already terminal.
    ///
    /// Returns whether the write happened.
    pub async fn update_task(&self, task: &Task) -> ModelPlaneResult<bool> {
        if let Some(doc) = self.store.get(TASK_INDEX, &task.id).await? {
            let stored: Task = decode(doc)?;
            if stored.state.is_terminal() {
                warn!(
                    task_id = %task.id,
                    state = %stored.state,
                    "Task already finished, ignoring update"
                );
                return Ok(false);
            }
        }
        let mut task = task.clone();
        task.last_updated_at = Utc::now();
        self.store.put(TASK_INDEX, &task.id, encode(&task)?, None).await?;
        Ok(true)
    }

    /// Most recent completed deploy task that ran on `node_id`.
    ///
    /// A missing task index means no history, not an error.
    pub async fn latest_completed_deploy_task(&self, node_id: &str) -> ModelPlaneResult<Option<Task>> {
        let query = SearchQuery::new()
            .term("task_type", encode(&TaskType::DeployModel)?)
            .term("state", encode(&TaskState::Completed)?)
            .term("worker_nodes", node_id)
            .sort("created_at", SortOrder::Desc)
            .size(1);
        let hits = match self.store.search(TASK_INDEX, &query).await {
            Ok(hits) => hits,
            Err(ModelPlaneError::ResourceNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        hits.into_iter().next().map(decode).transpose()
    }

    // Retry records

    /// Persisted auto-reload retry count; 0 when none was ever saved
    pub async fn get_retry_count(&self, node_id: &str) -> ModelPlaneResult<u32> {
        match self.store.get(MODEL_RELOAD_INDEX, node_id).await? {
            Some(doc) => Ok(decode::<RetryRecord>(doc)?.retry_count),
            None => Ok(0),
        }
    }

    pub async fn save_retry_count(&self, node_id: &str, retry_count: u32) -> ModelPlaneResult<()> {
        let record = RetryRecord {
            node_id: node_id.to_string(),
            retry_count,
        };
        self.store
            .put(MODEL_RELOAD_INDEX, node_id, encode(&record)?, None)
            .await?;
        Ok(())
    }

    // Connectors and controllers

    pub async fn get_connector(&self, connector_id: &str) -> ModelPlaneResult<Connector> {
        let doc = self
            .store
            .get(CONNECTOR_INDEX, connector_id)
            .await?
            .ok_or_else(|| ModelPlaneError::not_found(format!("connector {}", connector_id)))?;
        decode(doc)
    }

    pub async fn put_connector(&self, connector: &Connector) -> ModelPlaneResult<()> {
        self.store
            .put(CONNECTOR_INDEX, &connector.id, encode(connector)?, None)
            .await?;
        Ok(())
    }

    pub async fn get_controller(&self, model_id: &str) -> ModelPlaneResult<Option<ModelController>> {
        self.store
            .get(CONTROLLER_INDEX, model_id)
            .await?
            .map(decode)
            .transpose()
    }

    pub async fn put_controller(&self, controller: &ModelController) -> ModelPlaneResult<()> {
        self.store
            .put(CONTROLLER_INDEX, &controller.model_id, encode(controller)?, None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use modelplane_core::{Endpoint, FunctionCategory};

    fn repo() -> ModelRepository {
        ModelRepository::new(Arc::new(MemoryStore::new()))
    }

    fn meta(id: &str) -> ModelMeta {
        ModelMeta::new(
            id.to_string(),
            "bert".to_string(),
            "g1".to_string(),
            FunctionCategory::LocalBinary,
            1,
        )
    }

    #[tokio::test]
    async fn test_model_roundtrip_and_state() {
        let repo = repo();
        repo.create_model(&meta("m1")).await.unwrap();

        repo.update_model_state("m1", ModelState::Registered, Map::new())
            .await
            .unwrap();
        assert_eq!(repo.get_model("m1").await.unwrap().state, ModelState::Registered);

        let err = repo
            .update_model_state("m1", ModelState::Registering, Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ModelPlaneError::Validation(_)));

        let err = repo.get_model("m2").await.unwrap_err();
        assert!(matches!(err, ModelPlaneError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_chunks_are_siblings_of_meta() {
        let repo = repo();
        repo.create_model(&meta("m1")).await.unwrap();
        for n in 0..3 {
            repo.put_chunk(&ModelChunk::new("m1", n, vec![n as u8; 4]))
                .await
                .unwrap();
        }
        assert_eq!(repo.get_chunk("m1", 2).await.unwrap().content, vec![2; 4]);
        assert!(repo.chunk_exists("m1", 0).await.unwrap());

        assert_eq!(repo.delete_chunks("m1").await.unwrap(), 3);
        assert!(repo.get_model("m1").await.is_ok());
        assert!(matches!(
            repo.get_chunk("m1", 0).await.unwrap_err(),
            ModelPlaneError::ResourceNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_group_conditional_bump() {
        let repo = repo();
        let mut group = ModelGroup::new("g1".into(), "bert".into());
        repo.create_group(&group).await.unwrap();

        let (_, token) = repo.get_group("g1").await.unwrap();
        group.latest_version = 1;
        repo.put_group(&group, token).await.unwrap();

        // The old token is now stale
        group.latest_version = 2;
        let err = repo.put_group(&group, token).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(repo.get_group("g1").await.unwrap().0.latest_version, 1);
    }

    #[tokio::test]
    async fn test_terminal_task_not_overwritten() {
        let repo = repo();
        let mut task = Task::new(TaskType::RegisterModel, Some("m1".into()));
        repo.create_task(&task).await.unwrap();

        task.state = TaskState::Completed;
        assert!(repo.update_task(&task).await.unwrap());

        task.state = TaskState::Failed;
        assert!(!repo.update_task(&task).await.unwrap());
        assert_eq!(repo.get_task(&task.id).await.unwrap().state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_latest_completed_deploy_task() {
        let repo = repo();
        assert!(repo.latest_completed_deploy_task("n1").await.unwrap().is_none());

        let mut older = Task::new(TaskType::DeployModel, Some("old".into()));
        older.state = TaskState::Completed;
        older.worker_nodes = vec!["n1".into()];
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        repo.create_task(&older).await.unwrap();

        let mut newer = Task::new(TaskType::DeployModel, Some("new".into()));
        newer.state = TaskState::Completed;
        newer.worker_nodes = vec!["n0".into(), "n1".into()];
        repo.create_task(&newer).await.unwrap();

        let mut failed = Task::new(TaskType::DeployModel, Some("failed".into()));
        failed.state = TaskState::Failed;
        failed.worker_nodes = vec!["n1".into()];
        repo.create_task(&failed).await.unwrap();

        let found = repo.latest_completed_deploy_task("n1").await.unwrap().unwrap();
        assert_eq!(found.model_id.as_deref(), Some("new"));
        assert!(repo.latest_completed_deploy_task("n9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_count_defaults_to_zero() {
        let repo = repo();
        assert_eq!(repo.get_retry_count("n1").await.unwrap(), 0);
        repo.save_retry_count("n1", 4).await.unwrap();
        assert_eq!(repo.get_retry_count("n1").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_connector_and_controller() {
        let repo = repo();
        let connector = Connector {
            id: "c1".into(),
            name: "openai".into(),
            endpoint: Endpoint::new("api.example.com".into(), 443),
        };
        repo.put_connector(&connector).await.unwrap();
        assert_eq!(repo.get_connector("c1").await.unwrap().endpoint.port, 443);

        assert!(repo.get_controller("m1").await.unwrap().is_none());
    }
}
