use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};

use crate::error::{EngineError, Result};
use crate::lifecycle::{spawn_task, SpawnMode, TaskContext, TaskHandle, TaskInput};
use crate::model::{FinishReason, Job, JobFinishReason, JobState, JobType, Task, TaskId};
use crate::orchestrator::{JobCommand, JobEnv};
use crate::stream::{EventKind, EventStream, JobTransition};

/// Bookkeeping for one task index.
#[derive(Debug, Default, Clone)]
struct Slot {
    /// Non-terminal task currently occupying the index.
    current: Option<TaskId>,
    /// Tasks ever created for this index.
    attempts: u32,
    consecutive_failures: u32,
    /// Batch: finished normally, never run again.
    completed: bool,
    /// Service: above desired capacity, not replaced.
    retired: bool,
}

/// Actor driving one job.
pub struct JobExecution {
    job: Job,
    slots: Vec<Slot>,
    tasks: HashMap<TaskId, TaskHandle>,
    /// Set once the job is winding down; holds the reason it will finish with.
    terminating: Option<JobFinishReason>,
    ctx: Arc<TaskContext>,
    env: JobEnv,
    stream: EventStream,
    self_tx: mpsc::UnboundedSender<JobCommand>,
    cmd_rx: mpsc::UnboundedReceiver<JobCommand>,
    finished_rx: mpsc::UnboundedReceiver<Task>,
    view_tx: watch::Sender<Job>,
}

impl JobExecution {
    pub(crate) fn new(
        job: Job,
        stream: EventStream,
        env: JobEnv,
        self_tx: mpsc::UnboundedSender<JobCommand>,
        cmd_rx: mpsc::UnboundedReceiver<JobCommand>,
        view_tx: watch::Sender<Job>,
    ) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(env.task_template.context_for(
            &job,
            stream.clone(),
            finished_tx,
            env.shutdown.clone(),
        ));

        Self {
            job,
            slots: Vec::new(),
            tasks: HashMap::new(),
            terminating: None,
            ctx,
            env,
            stream,
            self_tx,
            cmd_rx,
            finished_rx,
            view_tx,
        }
    }

    pub(crate) async fn run(mut self, recovered_tasks: Vec<Task>, recovered: bool) {
        if recovered {
            self.resume(recovered_tasks).await;
        } else {
            self.start().await;
        }

        let shutdown = self.env.shutdown.clone();
        while !self.job.state.is_finished() {
            tokio::select! {
                Some(task) = self.finished_rx.recv() => self.on_task_finished(task).await,
                Some(cmd) = self.cmd_rx.recv() => self.on_command(cmd).await,
                _ = shutdown.cancelled() => {
                    tracing::debug!(job_id = %self.job.id, "Orchestrator stopping on shutdown");
                    break;
                }
            }
        }

        // Anyone still asking gets a definite answer.
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            let err = EngineError::JobFinished(self.job.id);
            match cmd {
                JobCommand::Kill { reply } => {
                    let _ = reply.send(Err(err));
                }
                JobCommand::UpdateCapacity { reply, .. } => {
                    let _ = reply.send(Err(err));
                }
                JobCommand::Replace { .. } => {}
            }
        }
    }

    async fn start(&mut self) {
        self.publish_job(None).await;
        self.persist_job();

        let count = self.job.descriptor.initial_task_count();
        self.slots = vec![Slot::default(); count as usize];
        for index in 0..count {
            self.create_task(index).await;
        }

        tracing::info!(
            job_id = %self.job.id,
            job_type = %self.job.job_type(),
            tasks = count,
            app = %self.job.descriptor.application_name,
            "Job accepted"
        );
        self.set_state(JobState::Active).await;
    }

    async fn resume(&mut self, tasks: Vec<Task>) {
        let size = match self.job.job_type() {
            JobType::Batch => self.job.descriptor.initial_task_count(),
            JobType::Service => self.job.capacity.map(|c| c.desired).unwrap_or(0),
        } as usize;
        self.slots = vec![Slot::default(); size];

        for index in &self.job.completed_indexes {
            if let Some(slot) = self.slots.get_mut(*index as usize) {
                slot.completed = true;
            }
        }

        let resumed = tasks.len();
        for task in tasks {
            let index = task.index as usize;
            if index >= self.slots.len() {
                // Left over from a scale-down; let it finish without replacement.
                self.slots.resize(
                    index + 1,
                    Slot {
                        retired: true,
                        ..Slot::default()
                    },
                );
            }
            let slot = &mut self.slots[index];
            slot.current = Some(task.id);
            slot.attempts = slot.attempts.max(task.resubmit_count + 1);

            let handle = spawn_task(task, self.ctx.clone(), SpawnMode::Recovered);
            self.env.registry.insert(handle.clone()).await;
            self.tasks.insert(handle.id(), handle);
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(attempts) = self.job.slot_attempts.get(&(index as u32)) {
                slot.attempts = slot.attempts.max(*attempts);
            }
        }

        tracing::info!(job_id = %self.job.id, tasks = resumed, "Job resumed");

        if self.job.kill_requested {
            self.begin_termination(JobFinishReason::Killed).await;
            return;
        }

        if let Some(index) = self.exhausted_index() {
            tracing::warn!(
                job_id = %self.job.id,
                index,
                "Retry budget was exhausted before restart, failing job"
            );
            if self.job.state == JobState::Accepted {
                self.set_state(JobState::Active).await;
            }
            self.begin_termination(JobFinishReason::Failed).await;
            return;
        }

        for index in 0..self.slots.len() as u32 {
            let slot = &self.slots[index as usize];
            if slot.current.is_none() && !slot.completed && !slot.retired {
                self.create_task(index).await;
            }
        }

        if self.job.state == JobState::Accepted {
            self.set_state(JobState::Active).await;
        }
        self.finish_if_complete().await;
    }

    async fn on_command(&mut self, cmd: JobCommand) {
        match cmd {
            JobCommand::Kill { reply } => {
                let _ = reply.send(self.kill().await);
            }
            JobCommand::UpdateCapacity { desired, reply } => {
                let _ = reply.send(self.update_capacity(desired).await);
            }
            JobCommand::Replace { index } => self.replace(index).await,
        }
    }

    async fn kill(&mut self) -> Result<()> {
        if self.job.state.is_finished() {
            return Err(EngineError::JobFinished(self.job.id));
        }
        if !self.job.kill_requested {
            tracing::info!(job_id = %self.job.id, "Job kill requested");
            self.job.kill_requested = true;
            self.persist_job();
        }
        self.begin_termination(JobFinishReason::Killed).await;
        Ok(())
    }

    async fn update_capacity(&mut self, desired: u32) -> Result<()> {
        let job_id = self.job.id;
        let Some(capacity) = self.job.capacity else {
            return Err(EngineError::InvalidCapacity {
                job_id,
                reason: "only service jobs have a capacity".to_string(),
            });
        };
        if self.terminating.is_some() {
            return Err(EngineError::JobFinished(job_id));
        }
        let updated = capacity.with_desired(desired);
        if !updated.is_valid() {
            return Err(EngineError::InvalidCapacity {
                job_id,
                reason: format!(
                    "desired {} outside [{}, {}]",
                    desired, capacity.min, capacity.max
                ),
            });
        }

        self.job.capacity = Some(updated);
        self.persist_job();

        let desired = desired as usize;
        if desired > self.slots.len() {
            self.slots.resize(desired, Slot::default());
        }
        let mut to_kill = Vec::new();
        let mut to_create = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if index < desired {
                if slot.retired || (slot.current.is_none() && slot.attempts == 0) {
                    slot.retired = false;
                    if slot.current.is_none() {
                        to_create.push(index as u32);
                    }
                }
            } else if !slot.retired {
                slot.retired = true;
                if let Some(task_id) = slot.current {
                    to_kill.push(task_id);
                }
            }
        }

        tracing::info!(
            job_id = %job_id,
            from = capacity.desired,
            to = desired,
            "Service capacity updated"
        );

        for index in to_create {
            self.create_task(index).await;
        }
        for task_id in to_kill {
            self.kill_task(task_id).await;
        }
        Ok(())
    }

    async fn on_task_finished(&mut self, task: Task) {
        let index = task.index as usize;
        if let Some(slot) = self.slots.get_mut(index) {
            if slot.current == Some(task.id) {
                slot.current = None;
            }
        }
        let reason = task.termination_reason.unwrap_or(FinishReason::Failed);

        if let Some(outcome) = self.terminating {
            tracing::debug!(job_id = %self.job.id, task_id = %task.id, "Task drained");
            self.finish_if_drained(outcome).await;
            return;
        }

        match self.job.job_type() {
            JobType::Batch => self.on_batch_task_finished(&task, reason).await,
            JobType::Service => self.on_service_task_finished(&task, reason).await,
        }
    }

    async fn on_batch_task_finished(&mut self, task: &Task, reason: FinishReason) {
        let index = task.index;
        let retry_limit = self.job.descriptor.retry_limit().unwrap_or(0);
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return;
        };

        if reason == FinishReason::Normal {
            slot.completed = true;
            slot.consecutive_failures = 0;
            self.job.completed_indexes.insert(index);
            self.persist_job();
            self.finish_if_complete().await;
            return;
        }

        if slot.attempts > retry_limit {
            tracing::warn!(
                job_id = %self.job.id,
                index,
                attempts = slot.attempts,
                reason = %reason,
                "Retry budget exhausted, failing job"
            );
            self.begin_termination(JobFinishReason::Failed).await;
            return;
        }

        tracing::info!(
            job_id = %self.job.id,
            index,
            attempt = slot.attempts + 1,
            reason = %reason,
            "Retrying batch task"
        );
        self.schedule_replacement(index, true).await;
    }

    async fn on_service_task_finished(&mut self, task: &Task, reason: FinishReason) {
        let index = task.index;
        let Some(slot) = self.slots.get(index as usize) else {
            return;
        };
        if slot.retired {
            tracing::debug!(job_id = %self.job.id, index, "Retired index, not replacing");
            return;
        }

        let failure = !matches!(reason, FinishReason::Normal | FinishReason::Killed);
        tracing::info!(
            job_id = %self.job.id,
            index,
            reason = %reason,
            "Replacing service task"
        );
        self.schedule_replacement(index, failure).await;
    }

    /// Create a replacement for `index` now, or after the backoff for its
    /// consecutive failures.
    async fn schedule_replacement(&mut self, index: u32, failure: bool) {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return;
        };
        if failure {
            slot.consecutive_failures += 1;
        } else {
            slot.consecutive_failures = 0;
        }

        let delay = self.env.retry.delay_for(slot.consecutive_failures);
        if delay.is_zero() {
            self.create_task(index).await;
            return;
        }

        tracing::debug!(job_id = %self.job.id, index, delay_ms = delay.as_millis() as u64, "Replacement delayed");
        let tx = self.self_tx.clone();
        let shutdown = self.env.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(JobCommand::Replace { index });
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    async fn replace(&mut self, index: u32) {
        if self.terminating.is_some() || self.job.state.is_finished() {
            return;
        }
        let Some(slot) = self.slots.get(index as usize) else {
            return;
        };
        if slot.current.is_some() || slot.retired || slot.completed {
            return;
        }
        self.create_task(index).await;
    }

    async fn create_task(&mut self, index: u32) {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return;
        };
        let task = Task::new(self.job.id, index, slot.attempts, Utc::now());
        slot.attempts += 1;
        slot.current = Some(task.id);
        self.job.slot_attempts.insert(index, slot.attempts);
        self.persist_job();

        let handle = spawn_task(task, self.ctx.clone(), SpawnMode::New);
        self.env.registry.insert(handle.clone()).await;
        self.tasks.insert(handle.id(), handle);
    }

    /// A batch index with no live task, not completed, whose budget is spent.
    fn exhausted_index(&self) -> Option<u32> {
        if self.job.job_type() != JobType::Batch {
            return None;
        }
        let retry_limit = self.job.descriptor.retry_limit().unwrap_or(0);
        self.slots
            .iter()
            .position(|s| s.current.is_none() && !s.completed && s.attempts > retry_limit)
            .map(|i| i as u32)
    }

    async fn kill_task(&self, task_id: TaskId) {
        if let Some(handle) = self.tasks.get(&task_id) {
            handle.tell(TaskInput::Kill).await;
        }
    }

    /// Stop creating tasks, kill the live ones, finish once none remain.
    async fn begin_termination(&mut self, outcome: JobFinishReason) {
        if self.terminating.is_none() {
            self.terminating = Some(outcome);
        }
        let live: Vec<TaskId> = self.slots.iter().filter_map(|s| s.current).collect();
        for task_id in live {
            self.kill_task(task_id).await;
        }
        if let Some(outcome) = self.terminating {
            self.finish_if_drained(outcome).await;
        }
    }

    async fn finish_if_drained(&mut self, outcome: JobFinishReason) {
        if self.slots.iter().all(|s| s.current.is_none()) {
            self.finish(outcome).await;
        }
    }

    async fn finish_if_complete(&mut self) {
        if self.job.job_type() == JobType::Batch
            && !self.slots.is_empty()
            && self.slots.iter().all(|s| s.completed)
        {
            self.finish(JobFinishReason::Normal).await;
        }
    }

    /// Finish the job. The new state is reported, and the stream completed,
    /// only once the final record of every task and of the job is durable.
    async fn finish(&mut self, reason: JobFinishReason) {
        if self.job.state.is_finished() {
            return;
        }
        let from = self.job.state;
        self.job.state = JobState::Finished(reason);
        self.job.updated_at = Utc::now();
        self.job.version += 1;
        self.ctx.store.save_job(&self.job);

        if !self.await_durable().await {
            tracing::debug!(job_id = %self.job.id, "Shutdown before final records were durable");
            return;
        }

        self.view_tx.send_replace(self.job.clone());
        self.publish_job(Some(from)).await;
        self.stream.complete().await;
        tracing::info!(job_id = %self.job.id, reason = ?reason, tasks = self.tasks.len(), "Job finished");
    }

    async fn await_durable(&self) -> bool {
        let store = &self.ctx.store;
        let shutdown = &self.env.shutdown;
        for handle in self.tasks.values() {
            let task = handle.snapshot();
            if !store.wait_for_task(&task.id, task.version, shutdown).await {
                return false;
            }
        }
        store
            .wait_for_job(&self.job.id, self.job.version, shutdown)
            .await
    }

    async fn set_state(&mut self, next: JobState) {
        let from = self.job.state;
        self.job.state = next;
        self.persist_job();
        self.publish_job(Some(from)).await;
    }

    async fn publish_job(&self, from: Option<JobState>) {
        let event = EventKind::Job(JobTransition {
            from,
            to: self.job.state,
        });
        self.stream.publish(event).await;
    }

    /// Save a new version of the job record and expose it.
    fn persist_job(&mut self) {
        self.job.updated_at = Utc::now();
        self.job.version += 1;
        self.view_tx.send_replace(self.job.clone());
        self.ctx.store.save_job(&self.job);
    }
}
