pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod placement;
pub mod reconciler;
pub mod shutdown;
pub mod store;
pub mod stream;

pub use config::EngineConfig;
pub use engine::{Engine, RecoveryReport};
pub use error::{EngineError, Result};
