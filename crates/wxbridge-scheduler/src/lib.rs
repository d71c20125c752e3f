pub mod engine;
pub mod error;
pub mod snapshot;
pub mod types;

pub use engine::{SchedulerHandle, TaskRunner, TICK_INTERVAL};
pub use error::{Result, SchedulerError};
pub use types::ScheduledTask;
