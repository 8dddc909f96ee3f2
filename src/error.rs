use thiserror::Error;

use crate::model::{JobId, TaskId};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Task not found or no longer active: {0}")]
    TaskNotFound(TaskId),

    #[error("Job already finished: {0}")]
    JobFinished(JobId),

    #[error("Invalid job descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid capacity update for job {job_id}: {reason}")]
    InvalidCapacity { job_id: JobId, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Actor mailbox closed: {0}")]
    ChannelClosed(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
