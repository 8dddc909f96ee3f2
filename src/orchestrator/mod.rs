//! Job orchestration.
//!
//! Each accepted job gets one [`JobExecution`] actor. It creates the job's
//! tasks, reacts to task completions by applying the batch or service policy
//! (retry, replace, finish), fans out kills, and publishes the job's own
//! state changes on its event stream.
//!
//! Task completions arrive on a dedicated unbounded channel so that a task
//! actor never blocks on its job.

mod execution;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{EngineError, Result};
use crate::lifecycle::{TaskContext, TaskRegistry, TimeoutPolicy};
use crate::model::{Job, JobId, JobState, Task};
use crate::placement::{AgentRuntime, Placement};
use crate::store::StoreWriter;
use crate::stream::{EventKind, EventStream, JobTransition};

pub use execution::JobExecution;

#[derive(Debug)]
pub enum JobCommand {
    Kill {
        reply: oneshot::Sender<Result<()>>,
    },
    UpdateCapacity {
        desired: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Backoff for a replacement elapsed.
    Replace { index: u32 },
}

/// Collaborators shared by every job of an engine.
#[derive(Clone)]
pub struct JobEnv {
    pub task_template: TaskTemplate,
    pub registry: TaskRegistry,
    pub retry: RetryConfig,
    pub subscriber_buffer: usize,
    pub shutdown: CancellationToken,
}

/// The parts of a [`TaskContext`] that do not depend on the job.
#[derive(Clone)]
pub struct TaskTemplate {
    pub policy: Arc<TimeoutPolicy>,
    pub placement: Arc<dyn Placement>,
    pub runtime: Arc<dyn AgentRuntime>,
    pub store: StoreWriter,
    pub mailbox_capacity: usize,
}

impl TaskTemplate {
    fn context_for(
        &self,
        job: &Job,
        stream: EventStream,
        finished_tx: mpsc::UnboundedSender<Task>,
        shutdown: CancellationToken,
    ) -> TaskContext {
        TaskContext {
            descriptor: job.descriptor.clone(),
            policy: self.policy.clone(),
            placement: self.placement.clone(),
            runtime: self.runtime.clone(),
            store: self.store.clone(),
            stream,
            finished_tx,
            mailbox_capacity: self.mailbox_capacity,
            shutdown,
        }
    }
}

/// Handle to a job's orchestrator.
#[derive(Clone)]
pub struct JobHandle {
    id: JobId,
    tx: mpsc::UnboundedSender<JobCommand>,
    view: watch::Receiver<Job>,
    stream: EventStream,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn snapshot(&self) -> Job {
        self.view.borrow().clone()
    }

    pub fn stream(&self) -> &EventStream {
        &self.stream
    }

    pub async fn kill(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(JobCommand::Kill { reply }, rx).await
    }

    pub async fn update_capacity(&self, desired: u32) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(JobCommand::UpdateCapacity { desired, reply }, rx)
            .await
    }

    /// Wait until the job is finished and return its final record.
    pub async fn finished(&self) -> Job {
        let mut view = self.view.clone();
        if let Ok(job) = view.wait_for(|job| job.state.is_finished()).await {
            return job.clone();
        }
        let last = view.borrow().clone();
        last
    }

    async fn request(&self, cmd: JobCommand, rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        if self.tx.send(cmd).is_err() {
            return Err(self.closed_error());
        }
        rx.await.map_err(|_| self.closed_error())?
    }

    fn closed_error(&self) -> EngineError {
        if matches!(self.view.borrow().state, JobState::Finished(_)) {
            EngineError::JobFinished(self.id)
        } else {
            EngineError::ChannelClosed(format!("orchestrator for job {}", self.id))
        }
    }
}

/// Start orchestrating a newly submitted job.
pub fn spawn_job(job: Job, env: JobEnv) -> JobHandle {
    launch(job, Vec::new(), env, false)
}

/// Resume a job loaded from the store with its still-active tasks.
pub fn resume_job(job: Job, tasks: Vec<Task>, env: JobEnv) -> JobHandle {
    if job.state.is_finished() {
        // Nothing to drive; keep the record queryable. Task history is not
        // reloaded, so the rebuilt stream only carries the final job state.
        let stream = EventStream::new(job.id, env.subscriber_buffer);
        let (tx, _) = mpsc::unbounded_channel();
        let (_, view) = watch::channel(job.clone());
        let handle = JobHandle {
            id: job.id,
            tx,
            view,
            stream: stream.clone(),
        };
        let state = job.state;
        tokio::spawn(async move {
            stream
                .publish(EventKind::Job(JobTransition {
                    from: None,
                    to: state,
                }))
                .await;
            stream.complete().await;
        });
        return handle;
    }
    launch(job, tasks, env, true)
}

fn launch(job: Job, tasks: Vec<Task>, env: JobEnv, recovered: bool) -> JobHandle {
    let stream = EventStream::new(job.id, env.subscriber_buffer);
    let (tx, rx) = mpsc::unbounded_channel();
    let (view_tx, view) = watch::channel(job.clone());

    let handle = JobHandle {
        id: job.id,
        tx: tx.clone(),
        view,
        stream: stream.clone(),
    };

    let execution = JobExecution::new(job, stream, env, tx, rx, view_tx);
    tokio::spawn(execution.run(tasks, recovered));

    handle
}
