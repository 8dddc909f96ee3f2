use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::lifecycle::actor::TaskHandle;
use crate::model::{JobId, Task, TaskId};

/// Task id -> actor handle, shared by the orchestrators, the reconciler and
/// the engine API.
///
/// Entries are added when a task is created and removed only when its job is
/// cleaned up, so finished tasks stay addressable (inputs to them are no-ops).
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<RwLock<HashMap<TaskId, TaskHandle>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: TaskHandle) {
        self.inner.write().await.insert(handle.id(), handle);
    }

    pub async fn get(&self, id: &TaskId) -> Option<TaskHandle> {
        self.inner.read().await.get(id).cloned()
    }

    /// Handles of tasks that have not finished yet, across all jobs.
    pub async fn active(&self) -> Vec<TaskHandle> {
        self.inner
            .read()
            .await
            .values()
            .filter(|h| h.is_active())
            .cloned()
            .collect()
    }

    /// Snapshots of every task of a job, ordered by index then creation.
    pub async fn tasks_of(&self, job_id: &JobId) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .inner
            .read()
            .await
            .values()
            .filter(|h| h.job_id() == *job_id)
            .map(|h| h.snapshot())
            .collect();
        tasks.sort_by_key(|t| (t.index, t.created_at, t.resubmit_count));
        tasks
    }

    /// Drop every entry of a job. Returns the removed task ids.
    pub async fn remove_job(&self, job_id: &JobId) -> Vec<TaskId> {
        let mut inner = self.inner.write().await;
        let removed: Vec<TaskId> = inner
            .values()
            .filter(|h| h.job_id() == *job_id)
            .map(|h| h.id())
            .collect();
        for id in &removed {
            inner.remove(id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
