//! Periodic supervisor sweep.
//!
//! Task actors arm their own timers, so the sweep is a safety net: it catches
//! deadlines missed while the process was down or busy, detects tasks whose
//! agent went silent, and enforces batch runtime limits. Every finding is
//! delivered to the owning actor like any other input, so a sweep racing a
//! legitimate transition is resolved by the actor.

pub mod liveness;

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::ReconcilerConfig;
use crate::lifecycle::{ApplyOutcome, TaskHandle, TaskRegistry};
use crate::model::{AgentId, TaskState};

pub use liveness::{AgentState, AgentTracker};

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub timeouts: usize,
    pub lost: usize,
    pub runtime_kills: usize,
    /// Silent agents dropped from tracking because no active task uses them.
    pub agents_forgotten: usize,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.timeouts == 0
            && self.lost == 0
            && self.runtime_kills == 0
            && self.agents_forgotten == 0
    }
}

#[derive(Clone)]
pub struct Reconciler {
    registry: TaskRegistry,
    agents: AgentTracker,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(registry: TaskRegistry, agents: AgentTracker, config: ReconcilerConfig) -> Self {
        Self {
            registry,
            agents,
            config,
        }
    }

    /// Sweep every active task once, as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let window = Duration::milliseconds(self.config.agent_liveness_window_ms as i64);

        for handle in self.registry.active().await {
            report.scanned += 1;
            let task = handle.snapshot();

            if task.deadline.is_some_and(|d| d <= now) {
                if handle.on_timeout_fired(now).await.is_applied() {
                    report.timeouts += 1;
                }
                continue;
            }

            if let Some(agent_id) = &task.agent_id {
                let heard = match (task.last_heard_at, self.agents.last_seen(agent_id).await) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
                if heard.is_some_and(|last| now - last > window) {
                    tracing::warn!(
                        task_id = %task.id,
                        agent_id = %agent_id,
                        "Agent silent past liveness window"
                    );
                    if handle.on_agent_lost().await.is_applied() {
                        report.lost += 1;
                    }
                    continue;
                }
            }

            if self.over_runtime_limit(&handle, now) {
                tracing::info!(task_id = %task.id, "Runtime limit exceeded, killing task");
                if matches!(handle.request_kill().await, ApplyOutcome::Applied { .. }) {
                    report.runtime_kills += 1;
                }
            }
        }

        report.agents_forgotten = self.forget_idle_agents(now, window).await;
        report
    }

    async fn forget_idle_agents(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let in_use: HashSet<AgentId> = self
            .registry
            .active()
            .await
            .iter()
            .filter_map(|h| h.snapshot().agent_id)
            .collect();

        let mut forgotten = 0;
        for agent_id in self.agents.silent_agents(now, window).await {
            if !in_use.contains(&agent_id) {
                tracing::debug!(agent_id = %agent_id, "Forgetting silent agent");
                self.agents.forget(&agent_id).await;
                forgotten += 1;
            }
        }
        forgotten
    }

    fn over_runtime_limit(&self, handle: &TaskHandle, now: DateTime<Utc>) -> bool {
        let Some(limit_ms) = handle.descriptor().runtime_limit_ms() else {
            return false;
        };
        let task = handle.snapshot();
        task.state == TaskState::Started
            && task.time_in_state(now) > Duration::milliseconds(limit_ms as i64)
    }

    /// Sweep on an interval until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep(Utc::now()).await;
                    if !report.is_quiet() {
                        tracing::info!(
                            scanned = report.scanned,
                            timeouts = report.timeouts,
                            lost = report.lost,
                            runtime_kills = report.runtime_kills,
                            agents_forgotten = report.agents_forgotten,
                            "Reconciler sweep"
                        );
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!("Reconciler stopped");
                    break;
                }
            }
        }
    }
}
