//! Per-task lifecycle management.
//!
//! # Components
//!
//! - [`state_machine`]: the pure transition function
//! - [`timeout`]: per job type and state deadlines
//! - [`actor`]: one actor per task; the only writer of that task's record
//! - [`registry`]: shared lookup from task id to actor handle
//!
//! # Serialization
//!
//! Agent reports, kill requests, placement results and timeouts all reach a
//! task through its actor's mailbox and are applied strictly one at a time.
//! A timeout that loses a race against a legitimate report is evaluated
//! against the state the report produced and rejected there.

pub mod actor;
pub mod registry;
pub mod state_machine;
pub mod timeout;

pub use actor::{spawn_task, ApplyOutcome, SpawnMode, TaskContext, TaskHandle, TaskInput};
pub use registry::TaskRegistry;
pub use state_machine::{transition, Rejection, TaskEvent, Transition};
pub use timeout::TimeoutPolicy;
