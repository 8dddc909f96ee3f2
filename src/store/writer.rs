use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::StoreConfig;
use crate::model::{Job, JobId, Task, TaskId};
use crate::store::{StoreError, TaskStore};

#[derive(Debug)]
enum WriteOp {
    Task(Task),
    Job(Job),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RecordKey {
    Task(TaskId),
    Job(JobId),
}

impl WriteOp {
    fn key(&self) -> RecordKey {
        match self {
            WriteOp::Task(task) => RecordKey::Task(task.id),
            WriteOp::Job(job) => RecordKey::Job(job.id),
        }
    }

    fn version(&self) -> u64 {
        match self {
            WriteOp::Task(task) => task.version,
            WriteOp::Job(job) => job.version,
        }
    }
}

/// The write loop's side of the confirmed-version map.
struct Confirmations {
    confirmed: Arc<RwLock<HashMap<RecordKey, u64>>>,
    progress: Arc<Notify>,
}

impl Confirmations {
    async fn record(&self, key: RecordKey, version: u64) {
        {
            let mut confirmed = self.confirmed.write().await;
            let entry = confirmed.entry(key).or_insert(0);
            *entry = (*entry).max(version);
        }
        self.progress.notify_waiters();
    }
}

enum WriteOutcome {
    Written,
    /// Permanent failure; the record was given up on.
    Dropped,
    Interrupted,
}

/// Non-blocking front of the persistence collaborator.
///
/// Saves are queued and written by a background loop. When several versions
/// of one record are queued, only the newest is written. Transient failures
/// are retried with exponential backoff until they succeed or shutdown.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
    confirmed: Arc<RwLock<HashMap<RecordKey, u64>>>,
    progress: Arc<Notify>,
}

impl StoreWriter {
    pub fn spawn(
        store: Arc<dyn TaskStore>,
        config: StoreConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let confirmed = Arc::new(RwLock::new(HashMap::new()));
        let progress = Arc::new(Notify::new());

        let worker = Confirmations {
            confirmed: confirmed.clone(),
            progress: progress.clone(),
        };
        tokio::spawn(async move {
            Self::write_loop(store, config, rx, worker, shutdown).await;
        });

        Self {
            tx,
            confirmed,
            progress,
        }
    }

    /// Queue a task record. Never blocks.
    pub fn save_task(&self, task: &Task) {
        if self.tx.send(WriteOp::Task(task.clone())).is_err() {
            tracing::warn!(task_id = %task.id, "Store writer stopped, task save dropped");
        }
    }

    /// Queue a job record. Never blocks.
    pub fn save_job(&self, job: &Job) {
        if self.tx.send(WriteOp::Job(job.clone())).is_err() {
            tracing::warn!(job_id = %job.id, "Store writer stopped, job save dropped");
        }
    }

    /// Highest record version of a task known to be durable.
    pub async fn durable_version(&self, task_id: &TaskId) -> Option<u64> {
        self.confirmed
            .read()
            .await
            .get(&RecordKey::Task(*task_id))
            .copied()
    }

    /// Highest record version of a job known to be durable.
    pub async fn durable_job_version(&self, job_id: &JobId) -> Option<u64> {
        self.confirmed
            .read()
            .await
            .get(&RecordKey::Job(*job_id))
            .copied()
    }

    /// Wait until `version` of the task, or a newer one, is durable.
    /// Returns false when shutdown came first.
    pub async fn wait_for_task(
        &self,
        task_id: &TaskId,
        version: u64,
        shutdown: &CancellationToken,
    ) -> bool {
        self.wait_for(RecordKey::Task(*task_id), version, shutdown)
            .await
    }

    /// Wait until `version` of the job record, or a newer one, is durable.
    /// Returns false when shutdown came first.
    pub async fn wait_for_job(
        &self,
        job_id: &JobId,
        version: u64,
        shutdown: &CancellationToken,
    ) -> bool {
        self.wait_for(RecordKey::Job(*job_id), version, shutdown)
            .await
    }

    /// Stop tracking the confirmed versions of a removed job and its tasks.
    pub async fn forget_job(&self, job_id: &JobId, task_ids: &[TaskId]) {
        let mut confirmed = self.confirmed.write().await;
        confirmed.remove(&RecordKey::Job(*job_id));
        for task_id in task_ids {
            confirmed.remove(&RecordKey::Task(*task_id));
        }
    }

    /// Number of records with a confirmed version.
    pub async fn tracked(&self) -> usize {
        self.confirmed.read().await.len()
    }

    async fn wait_for(&self, key: RecordKey, version: u64, shutdown: &CancellationToken) -> bool {
        loop {
            // Registered before the check so a confirmation in between is not missed.
            let progressed = self.progress.notified();
            if self
                .confirmed
                .read()
                .await
                .get(&key)
                .is_some_and(|v| *v >= version)
            {
                return true;
            }
            tokio::select! {
                _ = progressed => {}
                _ = shutdown.cancelled() => return false,
            }
        }
    }

    async fn write_loop(
        store: Arc<dyn TaskStore>,
        config: StoreConfig,
        mut rx: mpsc::UnboundedReceiver<WriteOp>,
        confirmations: Confirmations,
        shutdown: CancellationToken,
    ) {
        loop {
            let first = tokio::select! {
                op = rx.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let mut batch = vec![first];
            while let Ok(op) = rx.try_recv() {
                batch.push(op);
            }

            for op in coalesce(batch) {
                match Self::write_with_retry(store.as_ref(), &config, &op, &shutdown).await {
                    WriteOutcome::Written => {
                        confirmations.record(op.key(), op.version()).await;
                    }
                    WriteOutcome::Dropped => {}
                    WriteOutcome::Interrupted => return,
                }
            }
        }
        tracing::debug!("Store writer stopped");
    }

    async fn write_with_retry(
        store: &dyn TaskStore,
        config: &StoreConfig,
        op: &WriteOp,
        shutdown: &CancellationToken,
    ) -> WriteOutcome {
        let mut attempt: u32 = 0;
        loop {
            let result: Result<(), StoreError> = match op {
                WriteOp::Task(task) => store.save_task(task).await,
                WriteOp::Job(job) => store.save_job(job).await,
            };

            match result {
                Ok(()) => return WriteOutcome::Written,
                Err(e) if !e.is_transient() => {
                    tracing::error!(
                        record = ?op.key(),
                        version = op.version(),
                        error = %e,
                        "Store write failed permanently, dropping record"
                    );
                    return WriteOutcome::Dropped;
                }
                Err(e) => {
                    let delay = backoff_with_jitter(config, attempt);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        record = ?op.key(),
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store write failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => return WriteOutcome::Interrupted,
                    }
                }
            }
        }
    }
}

/// Keep only the last queued op per record, in the order of that last op.
fn coalesce(batch: Vec<WriteOp>) -> Vec<WriteOp> {
    let mut last_index: HashMap<RecordKey, usize> = HashMap::new();
    for (i, op) in batch.iter().enumerate() {
        last_index.insert(op.key(), i);
    }
    batch
        .into_iter()
        .enumerate()
        .filter(|(i, op)| last_index.get(&op.key()) == Some(i))
        .map(|(_, op)| op)
        .collect()
}

fn backoff_with_jitter(config: &StoreConfig, attempt: u32) -> Duration {
    let base = config
        .initial_backoff_ms
        .saturating_mul(1u64 << attempt.min(20))
        .min(config.max_backoff_ms);
    let jitter = if base > 1 {
        rand::thread_rng().gen_range(0..=base / 2)
    } else {
        0
    };
    Duration::from_millis(base.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskState;
    use crate::store::InMemoryStore;
    use chrono::Utc;

    #[test]
    fn coalesce_keeps_latest_per_record() {
        let job_id = JobId::new();
        let mut a1 = Task::new(job_id, 0, 0, Utc::now());
        let b = Task::new(job_id, 1, 0, Utc::now());
        let mut a2 = a1.clone();
        a1.version = 1;
        a2.version = 2;
        a2.state = TaskState::Launched;

        let out = coalesce(vec![
            WriteOp::Task(a1),
            WriteOp::Task(b.clone()),
            WriteOp::Task(a2),
        ]);
        assert_eq!(out.len(), 2);
        match (&out[0], &out[1]) {
            (WriteOp::Task(first), WriteOp::Task(second)) => {
                assert_eq!(first.id, b.id);
                assert_eq!(second.version, 2);
            }
            other => panic!("unexpected ops {:?}", other),
        }
    }

    #[test]
    fn backoff_is_capped() {
        let config = StoreConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
        };
        for attempt in 0..10 {
            let delay = backoff_with_jitter(&config, attempt);
            assert!(delay <= Duration::from_millis(60), "attempt {}", attempt);
        }
    }

    #[tokio::test]
    async fn failed_writes_are_retried_until_durable() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_saves(3);
        let writer = StoreWriter::spawn(
            store.clone(),
            StoreConfig {
                initial_backoff_ms: 5,
                max_backoff_ms: 20,
            },
            CancellationToken::new(),
        );

        let task = Task::new(JobId::new(), 0, 0, Utc::now());
        writer.save_task(&task);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while writer.durable_version(&task.id).await != Some(task.version) {
            assert!(tokio::time::Instant::now() < deadline, "write never confirmed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.task(&task.id).await.unwrap().id, task.id);
    }

    /// Rejects one task's record as unencodable, delegates everything else.
    struct RejectingStore {
        rejected: TaskId,
        inner: InMemoryStore,
    }

    #[async_trait::async_trait]
    impl TaskStore for RejectingStore {
        async fn load_jobs(&self) -> Result<Vec<Job>, StoreError> {
            self.inner.load_jobs().await
        }

        async fn load_active_tasks(&self) -> Result<Vec<Task>, StoreError> {
            self.inner.load_active_tasks().await
        }

        async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
            if task.id == self.rejected {
                return Err(StoreError::Encoding("unsupported field".to_string()));
            }
            self.inner.save_task(task).await
        }

        async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
            self.inner.save_job(job).await
        }
    }

    fn fast_config() -> StoreConfig {
        StoreConfig {
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
        }
    }

    #[tokio::test]
    async fn permanent_failure_does_not_stall_later_writes() {
        let job_id = JobId::new();
        let bad = Task::new(job_id, 0, 0, Utc::now());
        let good = Task::new(job_id, 1, 0, Utc::now());
        let store = Arc::new(RejectingStore {
            rejected: bad.id,
            inner: InMemoryStore::new(),
        });
        let shutdown = CancellationToken::new();
        let writer = StoreWriter::spawn(store.clone(), fast_config(), shutdown.clone());

        writer.save_task(&bad);
        writer.save_task(&good);

        let written = tokio::time::timeout(
            Duration::from_secs(2),
            writer.wait_for_task(&good.id, good.version, &shutdown),
        )
        .await;
        assert_eq!(written, Ok(true));
        assert_eq!(writer.durable_version(&bad.id).await, None);
        assert!(store.inner.task(&bad.id).await.is_none());
    }

    #[tokio::test]
    async fn wait_for_job_returns_once_confirmed() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_saves(2);
        let shutdown = CancellationToken::new();
        let writer = StoreWriter::spawn(store.clone(), fast_config(), shutdown.clone());

        let mut job = Job::new(
            JobId::new(),
            Arc::new(crate::model::JobDescriptor::batch("app", 1)),
            Utc::now(),
        );
        job.version = 4;
        writer.save_job(&job);

        let confirmed = tokio::time::timeout(
            Duration::from_secs(2),
            writer.wait_for_job(&job.id, 4, &shutdown),
        )
        .await;
        assert_eq!(confirmed, Ok(true));
        assert_eq!(writer.durable_job_version(&job.id).await, Some(4));
    }

    #[tokio::test]
    async fn wait_gives_up_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_saves(u32::MAX);
        let shutdown = CancellationToken::new();
        let writer = StoreWriter::spawn(store, fast_config(), shutdown.clone());

        let task = Task::new(JobId::new(), 0, 0, Utc::now());
        writer.save_task(&task);
        shutdown.cancel();
        assert!(!writer.wait_for_task(&task.id, task.version, &shutdown).await);
    }

    #[tokio::test]
    async fn forget_job_drops_confirmed_versions() {
        let store = Arc::new(InMemoryStore::new());
        let shutdown = CancellationToken::new();
        let writer = StoreWriter::spawn(store, fast_config(), shutdown.clone());

        let job = Job::new(
            JobId::new(),
            Arc::new(crate::model::JobDescriptor::batch("app", 1)),
            Utc::now(),
        );
        let task = Task::new(job.id, 0, 0, Utc::now());
        writer.save_job(&job);
        writer.save_task(&task);
        assert!(writer.wait_for_task(&task.id, task.version, &shutdown).await);
        assert!(writer.wait_for_job(&job.id, job.version, &shutdown).await);
        assert_eq!(writer.tracked().await, 2);

        writer.forget_job(&job.id, &[task.id]).await;
        assert_eq!(writer.tracked().await, 0);
        assert_eq!(writer.durable_version(&task.id).await, None);
    }
}
