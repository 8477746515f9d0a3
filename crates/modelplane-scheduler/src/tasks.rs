//! Per-node running-task limits

use modelplane_core::{LifecycleConfig, ModelPlaneError, ModelPlaneResult, TaskType};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Counts register and deploy tasks running on this node
pub struct RunningTasks {
    limits: HashMap<TaskType, usize>,
    running: Mutex<HashMap<TaskType, usize>>,
}

impl RunningTasks {
    pub fn new(config: &LifecycleConfig) -> Arc<Self> {
        let limits = HashMap::from([
            (TaskType::RegisterModel, config.max_register_tasks_per_node),
            (TaskType::DeployModel, config.max_deploy_tasks_per_node),
        ]);
        Arc::new(Self {
            limits,
            running: Mutex::new(HashMap::new()),
        })
    }

    fn counts(&self) -> std::sync::MutexGuard<'_, HashMap<TaskType, usize>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a slot; the slot is released when the returned guard drops
    pub fn try_acquire(self: &Arc<Self>, task_type: TaskType) -> ModelPlaneResult<TaskSlot> {
        let limit = self.limits.get(&task_type).copied().unwrap_or(usize::MAX);
        let mut counts = self.counts();
        let running = counts.entry(task_type).or_insert(0);
        if *running >= limit {
            return Err(ModelPlaneError::limit_exceeded(format!(
                "exceed max {} task limitation of {}",
                task_type, limit
            )));
        }
        *running += 1;
        debug!(task_type = %task_type, running = *running, "Acquired task slot");
        Ok(TaskSlot {
            tasks: Arc::clone(self),
            task_type,
        })
    }

    pub fn running(&self, task_type: TaskType) -> usize {
        self.counts().get(&task_type).copied().unwrap_or(0)
    }

    fn release(&self, task_type: TaskType) {
        let mut counts = self.counts();
        if let Some(running) = counts.get_mut(&task_type) {
            *running = running.saturating_sub(1);
        }
    }
}

/// A claimed running-task slot
#[must_use = "the slot is released as soon as it is dropped"]
pub struct TaskSlot {
    tasks: Arc<RunningTasks>,
    task_type: TaskType,
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.tasks.release(self.task_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_and_release() {
        let config = LifecycleConfig {
            max_deploy_tasks_per_node: 2,
            ..LifecycleConfig::default()
        };
        let tasks = RunningTasks::new(&config);

        let first = tasks.try_acquire(TaskType::DeployModel).unwrap();
        let _second = tasks.try_acquire(TaskType::DeployModel).unwrap();
        assert!(matches!(
            tasks.try_acquire(TaskType::DeployModel),
            Err(ModelPlaneError::LimitExceeded(_))
        ));

        // Register tasks are counted separately
        let _register = tasks.try_acquire(TaskType::RegisterModel).unwrap();

        drop(first);
        assert_eq!(tasks.running(TaskType::DeployModel), 1);
        assert!(tasks.try_acquire(TaskType::DeployModel).is_ok());
    }
}
