//! Task and retry records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of work a task tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    RegisterModel,
    DeployModel,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::RegisterModel => write!(f, "REGISTER_MODEL"),
            TaskType::DeployModel => write!(f, "DEPLOY_MODEL"),
        }
    }
}

/// Task state; the last three are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Created => write!(f, "CREATED"),
            TaskState::Running => write!(f, "RUNNING"),
            TaskState::Completed => write!(f, "COMPLETED"),
            TaskState::Failed => write!(f, "FAILED"),
            TaskState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Persisted record of a register or deploy operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub state: TaskState,
    #[serde(default)]
    pub model_id: Option<String>,
    /// Nodes the task ran on
    #[serde(default)]
    pub worker_nodes: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a task in CREATED state
    pub fn new(task_type: TaskType, model_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_type,
            state: TaskState::Created,
            model_id,
            worker_nodes: Vec::new(),
            error: None,
            created_at: now,
            last_updated_at: now,
        }
    }
}

/// Persisted auto-reload retry counter, keyed by node id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub node_id: String,
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new() {
        let task = Task::new(TaskType::DeployModel, Some("m1".to_string()));
        assert_eq!(task.state, TaskState::Created);
        assert_eq!(task.model_id.as_deref(), Some("m1"));
        assert!(task.worker_nodes.is_empty());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Created.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn test_task_serde() {
        let task = Task::new(TaskType::RegisterModel, None);
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["task_type"], "REGISTER_MODEL");
        assert_eq!(value["state"], "CREATED");
    }
}
