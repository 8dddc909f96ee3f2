use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{Job, JobId, Task, TaskId};
use crate::store::{StoreError, TaskStore};

/// Store backed by in-process maps. Used by tests and the simulator.
///
/// Records are round-tripped through JSON so that whatever is loaded back is
/// exactly what a real backend would have persisted.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    jobs: RwLock<HashMap<JobId, String>>,
    tasks: RwLock<HashMap<TaskId, String>>,
    fail_next: AtomicU32,
    task_writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` save calls fail with `Unavailable`.
    pub fn fail_next_saves(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of successful task writes so far.
    pub fn task_writes(&self) -> usize {
        self.task_writes.load(Ordering::SeqCst)
    }

    pub async fn task(&self, id: &TaskId) -> Option<Task> {
        let tasks = self.tasks.read().await;
        tasks.get(id).and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub async fn job(&self, id: &JobId) -> Option<Job> {
        let jobs = self.jobs.read().await;
        jobs.get(id).and_then(|raw| serde_json::from_str(raw).ok())
    }

    fn take_failure(&self) -> Result<(), StoreError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Encoding(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Encoding(e.to_string()))
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn load_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        jobs.values().map(|raw| decode(raw)).collect()
    }

    async fn load_active_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut active = Vec::new();
        for raw in tasks.values() {
            let task: Task = decode(raw)?;
            if task.is_active() {
                active.push(task);
            }
        }
        active.sort_by_key(|t| (t.job_id, t.index, t.created_at));
        Ok(active)
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.take_failure()?;
        let raw = encode(task)?;
        let mut tasks = self.tasks.write().await;
        // Never let an older version overwrite a newer one.
        if let Some(existing) = tasks.get(&task.id) {
            let existing: Task = decode(existing)?;
            if existing.version > task.version {
                return Ok(());
            }
        }
        tasks.insert(task.id, raw);
        self.task_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.take_failure()?;
        let raw = encode(job)?;
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(&job.id) {
            let existing: Job = decode(existing)?;
            if existing.version > job.version {
                return Ok(());
            }
        }
        jobs.insert(job.id, raw);
        Ok(())
    }
}
