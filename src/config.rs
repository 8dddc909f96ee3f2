use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-state timeouts, in milliseconds.
///
/// States without an entry here (`Accepted`, `Started`) wait indefinitely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// How long a task may sit in `Launched`, for both job types.
    pub task_in_launched_state_timeout_ms: u64,
    pub batch_task_in_start_initiated_state_timeout_ms: u64,
    pub service_task_in_start_initiated_state_timeout_ms: u64,
    /// How long a kill may go unconfirmed before the task is forced to finish.
    pub task_in_kill_initiated_state_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            task_in_launched_state_timeout_ms: 30 * 60 * 1000,
            batch_task_in_start_initiated_state_timeout_ms: 30 * 60 * 1000,
            service_task_in_start_initiated_state_timeout_ms: 5 * 60 * 1000,
            task_in_kill_initiated_state_timeout_ms: 5 * 60 * 1000,
        }
    }
}

/// Settings for the reconciliation sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconcilerConfig {
    pub interval_ms: u64,
    /// An agent silent for longer than this is considered lost.
    pub agent_liveness_window_ms: u64,
    /// How long a finished job stays queryable and subscribable.
    pub finished_job_retention_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            agent_liveness_window_ms: 10 * 60 * 1000,
            finished_job_retention_ms: 60 * 60 * 1000,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamConfig {
    /// Live events a subscriber may fall behind before it is disconnected.
    pub subscriber_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 1024,
        }
    }
}

/// Backoff applied before replacing a task that finished abnormally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Delay before the `consecutive_failures`-th replacement (1-based).
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exp = consecutive_failures.saturating_sub(1).min(31);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Backoff used by the store writer when a save fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub timeouts: TimeoutConfig,
    pub reconciler: ReconcilerConfig,
    pub stream: StreamConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
    /// Capacity of each task actor's mailbox.
    pub mailbox_capacity: usize,
}

const DEFAULT_MAILBOX_CAPACITY: usize = 64;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            reconciler: ReconcilerConfig::default(),
            stream: StreamConfig::default(),
            retry: RetryConfig::default(),
            store: StoreConfig::default(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut cfg: Self = serde_json::from_str(json)?;
        if cfg.mailbox_capacity == 0 {
            cfg.mailbox_capacity = DEFAULT_MAILBOX_CAPACITY;
        }
        Ok(cfg)
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_reconciler(mut self, reconciler: ReconcilerConfig) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_config_default() {
        let cfg = TimeoutConfig::default();
        assert_eq!(cfg.task_in_launched_state_timeout_ms, 1_800_000);
        assert_eq!(cfg.batch_task_in_start_initiated_state_timeout_ms, 1_800_000);
        assert_eq!(cfg.service_task_in_start_initiated_state_timeout_ms, 300_000);
        assert_eq!(cfg.task_in_kill_initiated_state_timeout_ms, 300_000);
    }

    #[test]
    fn engine_config_new() {
        let cfg = EngineConfig::new();
        assert_eq!(cfg.mailbox_capacity, 64);
        assert_eq!(cfg.reconciler.interval(), Duration::from_secs(5));
        assert_eq!(cfg.stream.subscriber_buffer, 1024);
    }

    #[test]
    fn from_json_overrides_only_given_fields() {
        let cfg = EngineConfig::from_json(
            r#"{
                "timeouts": {
                    "taskInLaunchedStateTimeoutMs": 2000,
                    "taskInKillInitiatedStateTimeoutMs": 100
                },
                "reconciler": { "intervalMs": 50 }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.timeouts.task_in_launched_state_timeout_ms, 2000);
        assert_eq!(cfg.timeouts.task_in_kill_initiated_state_timeout_ms, 100);
        assert_eq!(
            cfg.timeouts.service_task_in_start_initiated_state_timeout_ms,
            300_000
        );
        assert_eq!(cfg.reconciler.interval_ms, 50);
        assert_eq!(cfg.reconciler.agent_liveness_window_ms, 600_000);
        assert_eq!(cfg.mailbox_capacity, 64);
    }

    #[test]
    fn from_json_rejects_garbage() {
        assert!(EngineConfig::from_json("{ not json").is_err());
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let retry = RetryConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(retry.delay_for(0), Duration::ZERO);
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(4), Duration::from_millis(800));
        assert_eq!(retry.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(retry.delay_for(64), Duration::from_millis(1_000));
    }

    #[test]
    fn builders_replace_sections() {
        let cfg = EngineConfig::new()
            .with_timeouts(TimeoutConfig {
                task_in_launched_state_timeout_ms: 1,
                ..Default::default()
            })
            .with_retry(RetryConfig {
                initial_delay_ms: 0,
                max_delay_ms: 0,
            });
        assert_eq!(cfg.timeouts.task_in_launched_state_timeout_ms, 1);
        assert_eq!(cfg.retry.delay_for(3), Duration::ZERO);
    }
}
