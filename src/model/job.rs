use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    Batch,
    Service,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Batch => write!(f, "batch"),
            JobType::Service => write!(f, "service"),
        }
    }
}

/// Grouping metadata used by operators to correlate jobs of one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobGroupInfo {
    pub stack: String,
    pub detail: String,
    pub sequence: String,
}

/// Container and resource description. Passed through to the placement and
/// agent collaborators untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            attributes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJobExt {
    /// Number of tasks (indexes) the job runs to completion.
    pub size: u32,
    /// Replacements allowed per index after a non-normal finish.
    pub retry_limit: u32,
    /// Maximum time a task may spend in `Started` before it is killed.
    pub runtime_limit_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub min: u32,
    pub desired: u32,
    pub max: u32,
}

impl Capacity {
    pub fn new(min: u32, desired: u32, max: u32) -> Self {
        Self { min, desired, max }
    }

    /// Capacity with `min == desired == max`.
    pub fn fixed(size: u32) -> Self {
        Self::new(size, size, size)
    }

    pub fn is_valid(&self) -> bool {
        self.min <= self.desired && self.desired <= self.max
    }

    pub fn with_desired(self, desired: u32) -> Self {
        Self { desired, ..self }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPolicy {
    #[default]
    SystemDefault,
    SelfManaged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceJobExt {
    pub capacity: Capacity,
    #[serde(default)]
    pub migration_policy: MigrationPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobExtensions {
    Batch(BatchJobExt),
    Service(ServiceJobExt),
}

/// Immutable job specification. Shared by every task the job spawns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub application_name: String,
    #[serde(default)]
    pub job_group: JobGroupInfo,
    #[serde(default)]
    pub container: ContainerSpec,
    pub extensions: JobExtensions,
}

impl JobDescriptor {
    /// Batch job of `size` tasks with no retries.
    pub fn batch(application_name: impl Into<String>, size: u32) -> Self {
        Self {
            application_name: application_name.into(),
            job_group: JobGroupInfo::default(),
            container: ContainerSpec::default(),
            extensions: JobExtensions::Batch(BatchJobExt {
                size,
                retry_limit: 0,
                runtime_limit_ms: None,
            }),
        }
    }

    pub fn service(application_name: impl Into<String>, capacity: Capacity) -> Self {
        Self {
            application_name: application_name.into(),
            job_group: JobGroupInfo::default(),
            container: ContainerSpec::default(),
            extensions: JobExtensions::Service(ServiceJobExt {
                capacity,
                migration_policy: MigrationPolicy::default(),
            }),
        }
    }

    /// Sets the retry limit. No effect on service jobs.
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        if let JobExtensions::Batch(ext) = &mut self.extensions {
            ext.retry_limit = retry_limit;
        }
        self
    }

    /// Sets the runtime limit. No effect on service jobs.
    pub fn with_runtime_limit_ms(mut self, limit_ms: u64) -> Self {
        if let JobExtensions::Batch(ext) = &mut self.extensions {
            ext.runtime_limit_ms = Some(limit_ms);
        }
        self
    }

    pub fn with_job_group(mut self, job_group: JobGroupInfo) -> Self {
        self.job_group = job_group;
        self
    }

    pub fn with_container(mut self, container: ContainerSpec) -> Self {
        self.container = container;
        self
    }

    pub fn job_type(&self) -> JobType {
        match self.extensions {
            JobExtensions::Batch(_) => JobType::Batch,
            JobExtensions::Service(_) => JobType::Service,
        }
    }

    /// Number of tasks created when the job is accepted.
    pub fn initial_task_count(&self) -> u32 {
        match &self.extensions {
            JobExtensions::Batch(ext) => ext.size,
            JobExtensions::Service(ext) => ext.capacity.desired,
        }
    }

    pub fn retry_limit(&self) -> Option<u32> {
        match &self.extensions {
            JobExtensions::Batch(ext) => Some(ext.retry_limit),
            JobExtensions::Service(_) => None,
        }
    }

    pub fn runtime_limit_ms(&self) -> Option<u64> {
        match &self.extensions {
            JobExtensions::Batch(ext) => ext.runtime_limit_ms,
            JobExtensions::Service(_) => None,
        }
    }

    pub fn capacity(&self) -> Option<Capacity> {
        match &self.extensions {
            JobExtensions::Batch(_) => None,
            JobExtensions::Service(ext) => Some(ext.capacity),
        }
    }

    /// Check the descriptor is acceptable for submission.
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.trim().is_empty() {
            return Err("application name cannot be empty".to_string());
        }
        match &self.extensions {
            JobExtensions::Batch(ext) if ext.size == 0 => {
                Err("batch job size must be at least 1".to_string())
            }
            JobExtensions::Batch(ext) if ext.runtime_limit_ms == Some(0) => {
                Err("runtime limit must be positive".to_string())
            }
            JobExtensions::Service(ext) if !ext.capacity.is_valid() => Err(format!(
                "invalid capacity: min={} desired={} max={}",
                ext.capacity.min, ext.capacity.desired, ext.capacity.max
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobFinishReason {
    /// Every batch index finished normally.
    Normal,
    /// A batch index ran out of retries.
    Failed,
    /// The job was killed by the user.
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Accepted,
    Active,
    Finished(JobFinishReason),
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Finished(_))
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Accepted => write!(f, "accepted"),
            JobState::Active => write!(f, "active"),
            JobState::Finished(JobFinishReason::Normal) => write!(f, "finished(normal)"),
            JobState::Finished(JobFinishReason::Failed) => write!(f, "finished(failed)"),
            JobState::Finished(JobFinishReason::Killed) => write!(f, "finished(killed)"),
        }
    }
}

/// The orchestrator's record of an accepted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub descriptor: Arc<JobDescriptor>,
    pub state: JobState,
    /// Current service capacity; starts at the descriptor's and follows updates.
    pub capacity: Option<Capacity>,
    /// Set once a kill of the whole job was requested.
    pub kill_requested: bool,
    /// Batch indexes that already finished normally.
    #[serde(default)]
    pub completed_indexes: BTreeSet<u32>,
    /// Tasks ever created per index, finished ones included.
    #[serde(default)]
    pub slot_attempts: BTreeMap<u32, u32>,
    /// Bumped on every save of this record.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, descriptor: Arc<JobDescriptor>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            capacity: descriptor.capacity(),
            descriptor,
            state: JobState::Accepted,
            kill_requested: false,
            completed_indexes: BTreeSet::new(),
            slot_attempts: BTreeMap::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.descriptor.job_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_descriptor_defaults() {
        let d = JobDescriptor::batch("app", 3);
        assert_eq!(d.job_type(), JobType::Batch);
        assert_eq!(d.initial_task_count(), 3);
        assert_eq!(d.retry_limit(), Some(0));
        assert!(d.capacity().is_none());
        assert!(d.validate().is_ok());
    }

    #[test]
    fn service_builders_ignore_batch_settings() {
        let d = JobDescriptor::service("svc", Capacity::new(1, 2, 4))
            .with_retry_limit(5)
            .with_runtime_limit_ms(100);
        assert_eq!(d.job_type(), JobType::Service);
        assert_eq!(d.initial_task_count(), 2);
        assert_eq!(d.retry_limit(), None);
        assert_eq!(d.runtime_limit_ms(), None);
    }

    #[test]
    fn validate_rejects_bad_descriptors() {
        assert!(JobDescriptor::batch("", 1).validate().is_err());
        assert!(JobDescriptor::batch("app", 0).validate().is_err());
        assert!(JobDescriptor::service("svc", Capacity::new(3, 2, 4))
            .validate()
            .is_err());
        assert!(JobDescriptor::service("svc", Capacity::new(0, 5, 4))
            .validate()
            .is_err());
    }

    #[test]
    fn descriptor_json_shape() {
        let d = JobDescriptor::batch("app", 2).with_retry_limit(1);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["extensions"]["type"], "batch");
        assert_eq!(json["extensions"]["retry_limit"], 1);

        let back: JobDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn job_starts_accepted_with_descriptor_capacity() {
        let d = Arc::new(JobDescriptor::service("svc", Capacity::fixed(3)));
        let job = Job::new(JobId::new(), d, Utc::now());
        assert_eq!(job.state, JobState::Accepted);
        assert_eq!(job.capacity, Some(Capacity::fixed(3)));
        assert!(!job.kill_requested);
    }
}
