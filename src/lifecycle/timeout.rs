use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::TimeoutConfig;
use crate::model::{JobType, TaskState};

/// Immutable (job type, state) -> timeout table.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    table: HashMap<(JobType, TaskState), Duration>,
}

impl TimeoutPolicy {
    pub fn new(config: &TimeoutConfig) -> Self {
        let launched = Duration::from_millis(config.task_in_launched_state_timeout_ms);
        let kill = Duration::from_millis(config.task_in_kill_initiated_state_timeout_ms);

        let mut table = HashMap::new();
        for job_type in [JobType::Batch, JobType::Service] {
            table.insert((job_type, TaskState::Launched), launched);
            table.insert((job_type, TaskState::KillInitiated), kill);
        }
        table.insert(
            (JobType::Batch, TaskState::StartInitiated),
            Duration::from_millis(config.batch_task_in_start_initiated_state_timeout_ms),
        );
        table.insert(
            (JobType::Service, TaskState::StartInitiated),
            Duration::from_millis(config.service_task_in_start_initiated_state_timeout_ms),
        );

        Self { table }
    }

    /// Timeout for `state`, or `None` when the state waits indefinitely.
    pub fn timeout_for(&self, job_type: JobType, state: TaskState) -> Option<Duration> {
        self.table.get(&(job_type, state)).copied()
    }

    /// Deadline for a task entering `state` at `entered_at`.
    pub fn deadline_for(
        &self,
        job_type: JobType,
        state: TaskState,
        entered_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let timeout = self.timeout_for(job_type, state)?;
        let timeout = chrono::Duration::from_std(timeout).ok()?;
        entered_at.checked_add_signed(timeout)
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(&TimeoutConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FinishReason;

    fn test_config() -> TimeoutConfig {
        TimeoutConfig {
            task_in_launched_state_timeout_ms: 2_000,
            batch_task_in_start_initiated_state_timeout_ms: 3_000,
            service_task_in_start_initiated_state_timeout_ms: 4_000,
            task_in_kill_initiated_state_timeout_ms: 100,
        }
    }

    #[test]
    fn launched_and_kill_shared_by_job_types() {
        let policy = TimeoutPolicy::new(&test_config());
        for job_type in [JobType::Batch, JobType::Service] {
            assert_eq!(
                policy.timeout_for(job_type, TaskState::Launched),
                Some(Duration::from_millis(2_000))
            );
            assert_eq!(
                policy.timeout_for(job_type, TaskState::KillInitiated),
                Some(Duration::from_millis(100))
            );
        }
    }

    #[test]
    fn start_initiated_differs_by_job_type() {
        let policy = TimeoutPolicy::new(&test_config());
        assert_eq!(
            policy.timeout_for(JobType::Batch, TaskState::StartInitiated),
            Some(Duration::from_millis(3_000))
        );
        assert_eq!(
            policy.timeout_for(JobType::Service, TaskState::StartInitiated),
            Some(Duration::from_millis(4_000))
        );
    }

    #[test]
    fn untimed_states_have_no_deadline() {
        let policy = TimeoutPolicy::new(&test_config());
        let now = Utc::now();
        for state in [
            TaskState::Accepted,
            TaskState::Started,
            TaskState::Finished(FinishReason::Normal),
        ] {
            assert!(policy.deadline_for(JobType::Batch, state, now).is_none());
            assert!(policy.deadline_for(JobType::Service, state, now).is_none());
        }
    }

    #[test]
    fn deadline_is_entry_plus_timeout() {
        let policy = TimeoutPolicy::new(&test_config());
        let now = Utc::now();
        let deadline = policy
            .deadline_for(JobType::Batch, TaskState::Launched, now)
            .unwrap();
        assert_eq!(deadline - now, chrono::Duration::milliseconds(2_000));
    }
}
