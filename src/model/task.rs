use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{AgentId, JobId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinishReason {
    Normal,
    Failed,
    Killed,
    TimedOut,
    Lost,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinishReason::Normal => write!(f, "normal"),
            FinishReason::Failed => write!(f, "failed"),
            FinishReason::Killed => write!(f, "killed"),
            FinishReason::TimedOut => write!(f, "timed_out"),
            FinishReason::Lost => write!(f, "lost"),
        }
    }
}

/// Lifecycle state of a task. Declaration order is progress order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Accepted,
    Launched,
    StartInitiated,
    Started,
    KillInitiated,
    Finished(FinishReason),
}

impl TaskState {
    /// Position along the forward path. All `Finished` variants share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            TaskState::Accepted => 0,
            TaskState::Launched => 1,
            TaskState::StartInitiated => 2,
            TaskState::Started => 3,
            TaskState::KillInitiated => 4,
            TaskState::Finished(_) => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished(_))
    }

    /// True when moving from `self` to `next` makes progress.
    pub fn precedes(&self, next: &TaskState) -> bool {
        self.rank() < next.rank()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self {
            TaskState::Finished(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Non-terminal states, in progress order.
    pub fn active_states() -> [TaskState; 5] {
        [
            TaskState::Accepted,
            TaskState::Launched,
            TaskState::StartInitiated,
            TaskState::Started,
            TaskState::KillInitiated,
        ]
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Accepted => write!(f, "accepted"),
            TaskState::Launched => write!(f, "launched"),
            TaskState::StartInitiated => write!(f, "start_initiated"),
            TaskState::Started => write!(f, "started"),
            TaskState::KillInitiated => write!(f, "kill_initiated"),
            TaskState::Finished(reason) => write!(f, "finished({})", reason),
        }
    }
}

/// Mutable task record. Only the task's lifecycle actor writes it; everyone
/// else sees snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub index: u32,
    pub state: TaskState,
    pub state_entered_at: DateTime<Utc>,
    /// When the current state times out. `None` means wait indefinitely.
    pub deadline: Option<DateTime<Utc>>,
    pub agent_id: Option<AgentId>,
    pub termination_reason: Option<FinishReason>,
    pub termination_message: Option<String>,
    /// How many tasks ran on this index before this one.
    pub resubmit_count: u32,
    pub created_at: DateTime<Utc>,
    /// Last time anything was heard about this task from its agent.
    pub last_heard_at: Option<DateTime<Utc>>,
    /// Incremented on every applied transition.
    pub version: u64,
}

impl Task {
    pub fn new(job_id: JobId, index: u32, resubmit_count: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            job_id,
            index,
            state: TaskState::Accepted,
            state_entered_at: now,
            deadline: None,
            agent_id: None,
            termination_reason: None,
            termination_message: None,
            resubmit_count,
            created_at: now,
            last_heard_at: None,
            version: 1,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Time spent in the current state as of `now`.
    pub fn time_in_state(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.state_entered_at)
    }
}

/// Status pushed by the agent running a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusReport {
    pub task_id: TaskId,
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

impl AgentStatusReport {
    pub fn new(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            timestamp: Utc::now(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_follow_progress_order() {
        let states = TaskState::active_states();
        for pair in states.windows(2) {
            assert!(pair[0].precedes(&pair[1]), "{} < {}", pair[0], pair[1]);
        }
        assert!(TaskState::KillInitiated.precedes(&TaskState::Finished(FinishReason::Lost)));
    }

    #[test]
    fn finished_variants_share_rank() {
        let a = TaskState::Finished(FinishReason::Normal);
        let b = TaskState::Finished(FinishReason::TimedOut);
        assert!(!a.precedes(&b));
        assert!(!b.precedes(&a));
        assert!(a.is_terminal());
        assert_eq!(b.finish_reason(), Some(FinishReason::TimedOut));
    }

    #[test]
    fn new_task_is_accepted_without_deadline() {
        let now = Utc::now();
        let task = Task::new(JobId::new(), 2, 1, now);
        assert_eq!(task.state, TaskState::Accepted);
        assert_eq!(task.index, 2);
        assert_eq!(task.resubmit_count, 1);
        assert!(task.deadline.is_none());
        assert!(task.agent_id.is_none());
        assert!(task.is_active());
    }

    #[test]
    fn state_display() {
        assert_eq!(TaskState::StartInitiated.to_string(), "start_initiated");
        assert_eq!(
            TaskState::Finished(FinishReason::TimedOut).to_string(),
            "finished(timed_out)"
        );
    }
}
