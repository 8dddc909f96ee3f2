//! Persistence contract and the background writer that drives it.
//!
//! The engine applies transitions in memory first and hands each new record
//! to the [`StoreWriter`], which saves it in the background and retries
//! failed writes with backoff. Durable state therefore trails memory and
//! catches up monotonically; callers that need durability can ask for the
//! last confirmed record version of a task.

pub mod memory;
pub mod writer;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Job, Task};

pub use memory::InMemoryStore;
pub use writer::StoreWriter;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("record could not be encoded: {0}")]
    Encoding(String),
}

impl StoreError {
    /// Whether retrying the same write can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Durable storage for jobs and tasks.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Every stored job, finished or not.
    async fn load_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Every stored task that has not reached `Finished`.
    async fn load_active_tasks(&self) -> Result<Vec<Task>, StoreError>;

    async fn save_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;
}
