use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::lifecycle::state_machine::{transition, Rejection, TaskEvent, Transition};
use crate::lifecycle::timeout::TimeoutPolicy;
use crate::model::{AgentStatusReport, JobDescriptor, JobId, Task, TaskId, TaskState};
use crate::placement::{AgentRuntime, Placement, PlacementResult};
use crate::store::StoreWriter;
use crate::stream::{EventKind, EventStream, TaskTransition};

/// Inputs a task actor accepts.
#[derive(Debug, Clone)]
pub enum TaskInput {
    /// Result of the placement request issued on entering `Accepted`.
    Placed(PlacementResult),
    AgentStatus(AgentStatusReport),
    AgentLost,
    Kill,
    /// Retroactive timeout from the reconciler, as of its sweep time. Only
    /// honoured if the current state's deadline had passed by then.
    TimeoutCheck { as_of: DateTime<Utc> },
    /// The actor's own timer for the deadline it armed.
    TimerFired { armed_for: DateTime<Utc> },
}

/// What happened to an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { from: TaskState, to: TaskState },
    /// The task is finished; the input was absorbed.
    Noop(TaskState),
    Rejected(Rejection),
    /// A timeout for a deadline that no longer applies.
    Stale,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

#[derive(Debug)]
pub struct TaskCommand {
    input: TaskInput,
    reply: Option<oneshot::Sender<ApplyOutcome>>,
}

/// Everything a task actor needs from its job. Shared by all of the job's tasks.
pub struct TaskContext {
    pub descriptor: Arc<JobDescriptor>,
    pub policy: Arc<TimeoutPolicy>,
    pub placement: Arc<dyn Placement>,
    pub runtime: Arc<dyn AgentRuntime>,
    pub store: StoreWriter,
    pub stream: EventStream,
    /// Receives each task's final record, exactly once per task.
    pub finished_tx: mpsc::UnboundedSender<Task>,
    pub mailbox_capacity: usize,
    pub shutdown: CancellationToken,
}

/// How a task actor comes into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// Newly created task: announced on the stream and persisted.
    New,
    /// Loaded from the store: resumes from its stored state.
    Recovered,
}

/// Cheap, cloneable reference to a running (or finished) task actor.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    job_id: JobId,
    descriptor: Arc<JobDescriptor>,
    tx: mpsc::Sender<TaskCommand>,
    view: watch::Receiver<Task>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn descriptor(&self) -> &Arc<JobDescriptor> {
        &self.descriptor
    }

    /// Latest published record.
    pub fn snapshot(&self) -> Task {
        self.view.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.view.borrow().is_active()
    }

    /// Deliver an input and wait for its outcome. Inputs to a finished task
    /// are absorbed.
    pub async fn send(&self, input: TaskInput) -> ApplyOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = TaskCommand {
            input,
            reply: Some(reply_tx),
        };
        if self.tx.send(cmd).await.is_err() {
            return ApplyOutcome::Noop(self.view.borrow().state);
        }
        match reply_rx.await {
            Ok(outcome) => outcome,
            Err(_) => ApplyOutcome::Noop(self.view.borrow().state),
        }
    }

    /// Deliver an input without waiting for it to be applied.
    pub async fn tell(&self, input: TaskInput) {
        let _ = self.tx.send(TaskCommand { input, reply: None }).await;
    }

    pub async fn on_agent_status(&self, report: AgentStatusReport) -> ApplyOutcome {
        self.send(TaskInput::AgentStatus(report)).await
    }

    pub async fn on_agent_lost(&self) -> ApplyOutcome {
        self.send(TaskInput::AgentLost).await
    }

    pub async fn request_kill(&self) -> ApplyOutcome {
        self.send(TaskInput::Kill).await
    }

    pub async fn on_timeout_fired(&self, as_of: DateTime<Utc>) -> ApplyOutcome {
        self.send(TaskInput::TimeoutCheck { as_of }).await
    }

    /// Wait until the task reaches `Finished` and return its final record.
    pub async fn finished(&self) -> Task {
        let mut view = self.view.clone();
        if let Ok(task) = view.wait_for(|task| task.state.is_terminal()).await {
            return task.clone();
        }
        let last = view.borrow().clone();
        last
    }
}

/// Spawn the actor owning `task` and return its handle.
pub fn spawn_task(mut task: Task, ctx: Arc<TaskContext>, mode: SpawnMode) -> TaskHandle {
    if mode == SpawnMode::Recovered && task.deadline.is_none() {
        task.deadline =
            ctx.policy
                .deadline_for(ctx.descriptor.job_type(), task.state, task.state_entered_at);
    }

    let (tx, rx) = mpsc::channel(ctx.mailbox_capacity.max(1));
    let (view_tx, view_rx) = watch::channel(task.clone());

    let handle = TaskHandle {
        id: task.id,
        job_id: task.job_id,
        descriptor: ctx.descriptor.clone(),
        tx: tx.clone(),
        view: view_rx,
    };

    let actor = TaskActor {
        task,
        ctx,
        rx,
        self_tx: tx,
        view_tx,
    };
    tokio::spawn(actor.run(mode));

    handle
}

struct TaskActor {
    task: Task,
    ctx: Arc<TaskContext>,
    rx: mpsc::Receiver<TaskCommand>,
    self_tx: mpsc::Sender<TaskCommand>,
    view_tx: watch::Sender<Task>,
}

impl TaskActor {
    async fn run(mut self, mode: SpawnMode) {
        if mode == SpawnMode::New {
            self.ctx.store.save_task(&self.task);
            self.publish(None, None).await;
            tracing::debug!(
                task_id = %self.task.id,
                job_id = %self.task.job_id,
                index = self.task.index,
                "Task created"
            );
        }

        match self.task.state {
            TaskState::Accepted => self.request_placement(),
            TaskState::KillInitiated => self.send_kill(),
            _ => {}
        }

        while !self.task.state.is_terminal() {
            let armed = self.task.deadline;

            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    let outcome = self.handle(cmd.input).await;
                    if let Some(reply) = cmd.reply {
                        let _ = reply.send(outcome);
                    }
                }
                // Re-created every iteration, so a state change drops the old timer.
                _ = sleep_until(armed) => {
                    if let Some(armed_for) = armed {
                        self.handle(TaskInput::TimerFired { armed_for }).await;
                    }
                }
                _ = self.ctx.shutdown.cancelled() => break,
            }
        }

        // Answer anything still queued so callers never hang.
        self.rx.close();
        while let Ok(cmd) = self.rx.try_recv() {
            if let Some(reply) = cmd.reply {
                let _ = reply.send(ApplyOutcome::Noop(self.task.state));
            }
        }
    }

    async fn handle(&mut self, input: TaskInput) -> ApplyOutcome {
        let now = Utc::now();
        let state = self.task.state;

        let (event, message, placed_on) = match input {
            TaskInput::Placed(PlacementResult::Placed(agent_id)) => {
                (TaskEvent::PlacementSucceeded, None, Some(agent_id))
            }
            TaskInput::Placed(PlacementResult::Failed(reason)) => {
                (TaskEvent::PlacementFailed, Some(reason), None)
            }
            TaskInput::AgentStatus(report) => {
                if !state.is_terminal() {
                    self.task.last_heard_at = Some(now);
                }
                (TaskEvent::AgentReported(report.state), report.message, None)
            }
            TaskInput::AgentLost => (
                TaskEvent::AgentLost,
                Some("agent stopped reporting".to_string()),
                None,
            ),
            TaskInput::Kill => (TaskEvent::KillRequested, None, None),
            TaskInput::TimerFired { armed_for } => {
                if self.task.deadline != Some(armed_for) {
                    return ApplyOutcome::Stale;
                }
                (TaskEvent::TimeoutExpired, Some(timeout_message(state)), None)
            }
            TaskInput::TimeoutCheck { as_of } => match self.task.deadline {
                Some(deadline) if deadline <= as_of => {
                    (TaskEvent::TimeoutExpired, Some(timeout_message(state)), None)
                }
                _ if state.is_terminal() => return ApplyOutcome::Noop(state),
                _ => return ApplyOutcome::Stale,
            },
        };

        match transition(state, event) {
            Transition::Next(next) => {
                if let Some(agent_id) = placed_on {
                    self.task.agent_id = Some(agent_id);
                    self.task.last_heard_at = Some(now);
                }
                self.enter(next, now, message).await;
                ApplyOutcome::Applied {
                    from: state,
                    to: next,
                }
            }
            Transition::Noop => ApplyOutcome::Noop(state),
            Transition::Rejected(rejection) => {
                tracing::debug!(
                    task_id = %self.task.id,
                    state = %state,
                    event = %event,
                    reason = %rejection,
                    "Transition rejected"
                );
                if let Some(agent_id) = placed_on {
                    // Placement raced a kill; hand the agent back.
                    let placement = self.ctx.placement.clone();
                    let task_id = self.task.id;
                    tokio::spawn(async move { placement.release(task_id, &agent_id).await });
                }
                ApplyOutcome::Rejected(rejection)
            }
        }
    }

    /// Move to `next`. State, entry time, deadline and version change together.
    async fn enter(&mut self, next: TaskState, now: DateTime<Utc>, message: Option<String>) {
        let from = self.task.state;
        let job_type = self.ctx.descriptor.job_type();

        self.task.state = next;
        self.task.state_entered_at = now;
        self.task.deadline = self.ctx.policy.deadline_for(job_type, next, now);
        self.task.version += 1;
        if let TaskState::Finished(reason) = next {
            self.task.termination_reason = Some(reason);
            self.task.termination_message = message.clone();
        }

        self.view_tx.send_replace(self.task.clone());
        self.ctx.store.save_task(&self.task);
        self.publish(Some(from), message).await;

        tracing::info!(
            task_id = %self.task.id,
            job_id = %self.task.job_id,
            index = self.task.index,
            from = %from,
            to = %next,
            "Task state changed"
        );

        match next {
            TaskState::KillInitiated => self.send_kill(),
            TaskState::Finished(_) => {
                if let Some(agent_id) = self.task.agent_id.clone() {
                    let placement = self.ctx.placement.clone();
                    let task_id = self.task.id;
                    tokio::spawn(async move { placement.release(task_id, &agent_id).await });
                }
                if self.ctx.finished_tx.send(self.task.clone()).is_err() {
                    tracing::warn!(task_id = %self.task.id, "Job orchestrator gone, finish not delivered");
                }
            }
            _ => {}
        }
    }

    async fn publish(&self, from: Option<TaskState>, message: Option<String>) {
        let event = EventKind::Task(TaskTransition {
            task_id: self.task.id,
            index: self.task.index,
            from,
            to: self.task.state,
            reason: self.task.state.finish_reason(),
            message,
        });
        if self.ctx.stream.publish(event).await.is_none() {
            tracing::warn!(task_id = %self.task.id, "Event stream already completed");
        }
    }

    fn request_placement(&self) {
        let placement = self.ctx.placement.clone();
        let descriptor = self.ctx.descriptor.clone();
        let task = self.task.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = placement.place_task(&task, &descriptor).await;
            if let PlacementResult::Failed(reason) = &result {
                tracing::warn!(task_id = %task.id, reason = %reason, "Placement failed");
            }
            let _ = tx
                .send(TaskCommand {
                    input: TaskInput::Placed(result),
                    reply: None,
                })
                .await;
        });
    }

    fn send_kill(&self) {
        let Some(agent_id) = self.task.agent_id.clone() else {
            tracing::debug!(task_id = %self.task.id, "No agent assigned, kill waits for timeout");
            return;
        };
        let runtime = self.ctx.runtime.clone();
        let task_id = self.task.id;
        tokio::spawn(async move { runtime.kill_task(task_id, &agent_id).await });
    }
}

fn timeout_message(state: TaskState) -> String {
    format!("timed out in state {}", state)
}

async fn sleep_until(deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(deadline) => {
            let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(remaining).await;
        }
        None => std::future::pending::<()>().await,
    }
}
