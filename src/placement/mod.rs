//! Interfaces to the placement scheduler and the agent runtime.
//!
//! Neither collaborator is implemented here for real. The engine only needs:
//! - [`Placement::place_task`]: pick an agent for a task (asynchronous)
//! - [`Placement::release`]: return a finished task's share of its agent
//! - [`AgentRuntime::kill_task`]: ask an agent to stop a task (best effort)
//!
//! [`LeastLoadedPlacement`] and [`RecordingRuntime`] are in-process versions
//! used by the simulator and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::model::{AgentId, JobDescriptor, Task, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementResult {
    Placed(AgentId),
    Failed(String),
}

#[async_trait]
pub trait Placement: Send + Sync + 'static {
    async fn place_task(&self, task: &Task, descriptor: &JobDescriptor) -> PlacementResult;

    async fn release(&self, task_id: TaskId, agent_id: &AgentId);
}

#[async_trait]
pub trait AgentRuntime: Send + Sync + 'static {
    /// Signal the agent to stop the task. Completion is reported back
    /// through the agent status feed, if at all.
    async fn kill_task(&self, task_id: TaskId, agent_id: &AgentId);
}

/// Places each task on the agent currently running the fewest tasks.
#[derive(Debug)]
pub struct LeastLoadedPlacement {
    agents: Mutex<HashMap<AgentId, HashSet<TaskId>>>,
    available: AtomicBool,
}

impl LeastLoadedPlacement {
    pub fn new<I, A>(agents: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<AgentId>,
    {
        Self {
            agents: Mutex::new(
                agents
                    .into_iter()
                    .map(|a| (a.into(), HashSet::new()))
                    .collect(),
            ),
            available: AtomicBool::new(true),
        }
    }

    /// When false, every placement fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Tasks currently assigned to `agent_id`.
    pub async fn running_on(&self, agent_id: &AgentId) -> usize {
        self.agents
            .lock()
            .await
            .get(agent_id)
            .map(|tasks| tasks.len())
            .unwrap_or(0)
    }

    pub async fn total_running(&self) -> usize {
        self.agents.lock().await.values().map(|t| t.len()).sum()
    }
}

#[async_trait]
impl Placement for LeastLoadedPlacement {
    async fn place_task(&self, task: &Task, descriptor: &JobDescriptor) -> PlacementResult {
        if !self.available.load(Ordering::SeqCst) {
            return PlacementResult::Failed("no agents available".to_string());
        }

        let mut agents = self.agents.lock().await;
        let chosen = agents
            .iter()
            .min_by(|(a_id, a), (b_id, b)| a.len().cmp(&b.len()).then_with(|| a_id.cmp(b_id)))
            .map(|(id, _)| id.clone());

        match chosen {
            Some(agent_id) => {
                if let Some(tasks) = agents.get_mut(&agent_id) {
                    tasks.insert(task.id);
                }
                tracing::debug!(
                    task_id = %task.id,
                    agent_id = %agent_id,
                    image = %descriptor.container.image,
                    "Task placed"
                );
                PlacementResult::Placed(agent_id)
            }
            None => PlacementResult::Failed("no agents registered".to_string()),
        }
    }

    async fn release(&self, task_id: TaskId, agent_id: &AgentId) {
        if let Some(tasks) = self.agents.lock().await.get_mut(agent_id) {
            tasks.remove(&task_id);
        }
    }
}

/// Records kill requests and optionally forwards them to a listener, which
/// lets a simulated agent confirm kills.
#[derive(Debug, Default)]
pub struct RecordingRuntime {
    kills: Mutex<Vec<(TaskId, AgentId)>>,
    listener: Option<mpsc::UnboundedSender<TaskId>>,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kill_listener(listener: mpsc::UnboundedSender<TaskId>) -> Self {
        Self {
            kills: Mutex::new(Vec::new()),
            listener: Some(listener),
        }
    }

    pub async fn kill_requests(&self) -> Vec<(TaskId, AgentId)> {
        self.kills.lock().await.clone()
    }

    pub async fn was_killed(&self, task_id: &TaskId) -> bool {
        self.kills.lock().await.iter().any(|(id, _)| id == task_id)
    }
}

#[async_trait]
impl AgentRuntime for RecordingRuntime {
    async fn kill_task(&self, task_id: TaskId, agent_id: &AgentId) {
        tracing::debug!(task_id = %task_id, agent_id = %agent_id, "Kill signal sent");
        self.kills.lock().await.push((task_id, agent_id.clone()));
        if let Some(listener) = &self.listener {
            let _ = listener.send(task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobId;
    use chrono::Utc;

    #[tokio::test]
    async fn places_on_least_loaded_agent() {
        let placement = LeastLoadedPlacement::new(["agent-a", "agent-b"]);
        let descriptor = JobDescriptor::batch("app", 3);
        let job_id = JobId::new();

        let t1 = Task::new(job_id, 0, 0, Utc::now());
        let t2 = Task::new(job_id, 1, 0, Utc::now());
        let a1 = placement.place_task(&t1, &descriptor).await;
        let a2 = placement.place_task(&t2, &descriptor).await;

        assert_eq!(a1, PlacementResult::Placed(AgentId::from("agent-a")));
        assert_eq!(a2, PlacementResult::Placed(AgentId::from("agent-b")));
        assert_eq!(placement.total_running().await, 2);

        placement.release(t1.id, &AgentId::from("agent-a")).await;
        assert_eq!(placement.running_on(&AgentId::from("agent-a")).await, 0);
    }

    #[tokio::test]
    async fn unavailable_placement_fails() {
        let placement = LeastLoadedPlacement::new(["agent-a"]);
        placement.set_available(false);
        let task = Task::new(JobId::new(), 0, 0, Utc::now());
        let result = placement
            .place_task(&task, &JobDescriptor::batch("app", 1))
            .await;
        assert!(matches!(result, PlacementResult::Failed(_)));
    }

    #[tokio::test]
    async fn empty_placement_fails() {
        let placement = LeastLoadedPlacement::new(Vec::<AgentId>::new());
        let task = Task::new(JobId::new(), 0, 0, Utc::now());
        let result = placement
            .place_task(&task, &JobDescriptor::batch("app", 1))
            .await;
        assert_eq!(
            result,
            PlacementResult::Failed("no agents registered".to_string())
        );
    }

    #[tokio::test]
    async fn runtime_records_and_forwards_kills() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runtime = RecordingRuntime::with_kill_listener(tx);
        let task_id = TaskId::new();
        runtime.kill_task(task_id, &AgentId::from("agent-a")).await;

        assert!(runtime.was_killed(&task_id).await);
        assert_eq!(rx.recv().await, Some(task_id));
    }
}
