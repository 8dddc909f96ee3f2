use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::model::AgentId;

/// Last contact with one agent.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub id: AgentId,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentState {
    pub fn new(id: AgentId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            last_heartbeat: now,
        }
    }

    pub fn update_heartbeat(&mut self, now: DateTime<Utc>) {
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
    }

    pub fn is_alive(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.last_heartbeat <= window
    }
}

/// Tracks when each agent was last heard from, either through a heartbeat or
/// a task status report.
#[derive(Debug, Clone, Default)]
pub struct AgentTracker {
    agents: Arc<RwLock<HashMap<AgentId, AgentState>>>,
}

impl AgentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record contact. Unknown agents are registered on first contact.
    pub async fn heartbeat(&self, agent_id: &AgentId, now: DateTime<Utc>) {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(agent) => agent.update_heartbeat(now),
            None => {
                agents.insert(agent_id.clone(), AgentState::new(agent_id.clone(), now));
                tracing::debug!(agent_id = %agent_id, "Agent registered");
            }
        }
    }

    pub async fn last_seen(&self, agent_id: &AgentId) -> Option<DateTime<Utc>> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|a| a.last_heartbeat)
    }

    /// Agents whose last contact is older than `window`.
    pub async fn silent_agents(&self, now: DateTime<Utc>, window: Duration) -> Vec<AgentId> {
        let mut silent: Vec<AgentId> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| !a.is_alive(now, window))
            .map(|a| a.id.clone())
            .collect();
        silent.sort();
        silent
    }

    pub async fn forget(&self, agent_id: &AgentId) {
        self.agents.write().await.remove(agent_id);
    }
}
