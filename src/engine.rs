use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::lifecycle::{ApplyOutcome, TaskRegistry, TimeoutPolicy};
use crate::model::{AgentId, AgentStatusReport, Job, JobDescriptor, JobId, Task, TaskId};
use crate::orchestrator::{resume_job, spawn_job, JobEnv, JobHandle, TaskTemplate};
use crate::placement::{AgentRuntime, Placement};
use crate::reconciler::{AgentTracker, Reconciler};
use crate::store::{StoreWriter, TaskStore};
use crate::stream::Subscription;

/// Counts from [`Engine::recover`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub jobs: usize,
    pub tasks: usize,
    /// Active tasks whose job record was missing.
    pub orphaned_tasks: usize,
}

/// Entry point tying the orchestrators, the task actors, the reconciler and
/// the store together.
///
/// Cloning is cheap; every clone drives the same engine.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    env: JobEnv,
    store: Arc<dyn TaskStore>,
    jobs: Arc<RwLock<HashMap<JobId, JobHandle>>>,
    agents: AgentTracker,
    shutdown: CancellationToken,
}

impl Engine {
    /// Build an engine. Must be called inside a tokio runtime: the store
    /// writer starts immediately.
    pub fn new(
        config: EngineConfig,
        placement: Arc<dyn Placement>,
        runtime: Arc<dyn AgentRuntime>,
        store: Arc<dyn TaskStore>,
        shutdown: CancellationToken,
    ) -> Self {
        let writer = StoreWriter::spawn(store.clone(), config.store.clone(), shutdown.clone());
        let env = JobEnv {
            task_template: TaskTemplate {
                policy: Arc::new(TimeoutPolicy::new(&config.timeouts)),
                placement,
                runtime,
                store: writer,
                mailbox_capacity: config.mailbox_capacity,
            },
            registry: TaskRegistry::new(),
            retry: config.retry.clone(),
            subscriber_buffer: config.stream.subscriber_buffer,
            shutdown: shutdown.clone(),
        };

        Self {
            config: Arc::new(config),
            env,
            store,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            agents: AgentTracker::new(),
            shutdown,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every loop and actor of this engine.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.env.registry.clone(),
            self.agents.clone(),
            self.config.reconciler.clone(),
        )
    }

    /// Spawn the background loops: the reconciler sweep and finished-job
    /// housekeeping. Both stop on shutdown.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let reconciler = self.reconciler();
        let shutdown = self.shutdown.clone();
        let sweeper = tokio::spawn(async move { reconciler.run(shutdown).await });

        let engine = self.clone();
        let housekeeping = tokio::spawn(async move { engine.housekeeping_loop().await });

        tracing::info!(
            interval_ms = self.config.reconciler.interval_ms,
            "Engine started"
        );
        vec![sweeper, housekeeping]
    }

    async fn housekeeping_loop(self) {
        let mut interval = tokio::time::interval(self.config.reconciler.interval());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = self.cleanup_finished_jobs(Utc::now()).await;
                    if removed > 0 {
                        tracing::debug!(removed, "Finished jobs cleaned up");
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    /// Validate and accept a job. Its tasks are created asynchronously.
    pub async fn submit_job(&self, descriptor: JobDescriptor) -> Result<JobId> {
        descriptor
            .validate()
            .map_err(EngineError::InvalidDescriptor)?;

        let job = Job::new(JobId::new(), Arc::new(descriptor), Utc::now());
        let job_id = job.id;
        let handle = spawn_job(job, self.env.clone());
        self.jobs.write().await.insert(job_id, handle);

        tracing::debug!(job_id = %job_id, "Job submitted");
        Ok(job_id)
    }

    pub async fn kill_job(&self, job_id: JobId) -> Result<()> {
        self.job_handle(&job_id).await?.kill().await
    }

    /// Kill one task. Under a batch job the kill consumes a retry; under a
    /// service job the task is replaced.
    pub async fn kill_task(&self, task_id: TaskId) -> Result<ApplyOutcome> {
        let handle = self
            .env
            .registry
            .get(&task_id)
            .await
            .ok_or(EngineError::TaskNotFound(task_id))?;
        Ok(handle.request_kill().await)
    }

    /// Subscribe to a job's events: everything so far, then live.
    pub async fn subscribe(&self, job_id: JobId) -> Result<Subscription> {
        Ok(self.job_handle(&job_id).await?.stream().subscribe().await)
    }

    /// Apply a status report from an agent. Counts as contact with the
    /// task's agent.
    pub async fn report_status(&self, report: AgentStatusReport) -> Result<ApplyOutcome> {
        let handle = self
            .env
            .registry
            .get(&report.task_id)
            .await
            .ok_or(EngineError::TaskNotFound(report.task_id))?;

        if let Some(agent_id) = handle.snapshot().agent_id {
            self.agents.heartbeat(&agent_id, Utc::now()).await;
        }
        Ok(handle.on_agent_status(report).await)
    }

    pub async fn agent_heartbeat(&self, agent_id: &AgentId) {
        self.agents.heartbeat(agent_id, Utc::now()).await;
    }

    /// Change a service job's desired size.
    pub async fn update_capacity(&self, job_id: JobId, desired: u32) -> Result<()> {
        self.job_handle(&job_id).await?.update_capacity(desired).await
    }

    pub async fn job(&self, job_id: JobId) -> Result<Job> {
        Ok(self.job_handle(&job_id).await?.snapshot())
    }

    pub async fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .map(|h| h.snapshot())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Wait until the job is finished.
    pub async fn wait_for_job(&self, job_id: JobId) -> Result<Job> {
        Ok(self.job_handle(&job_id).await?.finished().await)
    }

    /// Every task the job has created, finished ones included.
    pub async fn tasks(&self, job_id: JobId) -> Result<Vec<Task>> {
        self.job_handle(&job_id).await?;
        Ok(self.env.registry.tasks_of(&job_id).await)
    }

    pub async fn task(&self, task_id: TaskId) -> Result<Task> {
        self.env
            .registry
            .get(&task_id)
            .await
            .map(|h| h.snapshot())
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    /// Wait until the task is finished.
    pub async fn wait_for_task(&self, task_id: TaskId) -> Result<Task> {
        let handle = self
            .env
            .registry
            .get(&task_id)
            .await
            .ok_or(EngineError::TaskNotFound(task_id))?;
        Ok(handle.finished().await)
    }

    /// Highest version of the task confirmed written to the store.
    pub async fn durable_version(&self, task_id: TaskId) -> Option<u64> {
        self.env.task_template.store.durable_version(&task_id).await
    }

    /// Rebuild in-memory state from the store. Tasks resume from their
    /// stored states with timers re-armed from the stored deadlines.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let jobs = self.store.load_jobs().await?;
        let tasks = self.store.load_active_tasks().await?;

        let mut by_job: HashMap<JobId, Vec<Task>> = HashMap::new();
        for task in tasks {
            by_job.entry(task.job_id).or_default().push(task);
        }

        let mut report = RecoveryReport::default();
        let mut known = self.jobs.write().await;
        for job in jobs {
            if known.contains_key(&job.id) {
                continue;
            }
            let job_tasks = by_job.remove(&job.id).unwrap_or_default();
            report.jobs += 1;
            report.tasks += job_tasks.len();
            let job_id = job.id;
            known.insert(job_id, resume_job(job, job_tasks, self.env.clone()));
        }

        for (job_id, orphans) in by_job {
            tracing::warn!(job_id = %job_id, tasks = orphans.len(), "Active tasks without a job record, skipped");
            report.orphaned_tasks += orphans.len();
        }

        tracing::info!(
            jobs = report.jobs,
            tasks = report.tasks,
            orphaned = report.orphaned_tasks,
            "Recovered state from store"
        );
        Ok(report)
    }

    /// Forget jobs that finished more than the retention period before `now`.
    pub async fn cleanup_finished_jobs(&self, now: DateTime<Utc>) -> usize {
        let retention = Duration::milliseconds(self.config.reconciler.finished_job_retention_ms as i64);
        let expired: Vec<JobId> = self
            .jobs
            .read()
            .await
            .values()
            .map(|h| h.snapshot())
            .filter(|job| job.state.is_finished() && now - job.updated_at >= retention)
            .map(|job| job.id)
            .collect();

        for job_id in &expired {
            self.jobs.write().await.remove(job_id);
            let tasks = self.env.registry.remove_job(job_id).await;
            self.env
                .task_template
                .store
                .forget_job(job_id, &tasks)
                .await;
            tracing::debug!(job_id = %job_id, tasks = tasks.len(), "Finished job removed");
        }
        expired.len()
    }

    async fn job_handle(&self, job_id: &JobId) -> Result<JobHandle> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or(EngineError::JobNotFound(*job_id))
    }
}
