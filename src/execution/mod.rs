//! Workflow Execution Module
//!
//! Runs workflows on the tokio runtime.
//!
//! # Architecture
//!
//! - [`scheduler`]: FIFO admission of whole workflows under a concurrency cap
//! - [`engine`]: Walks one workflow's step graph
//! - [`step`]: Individual step dispatch with timeouts and retries

pub mod engine;
pub mod scheduler;
mod step;

pub use engine::Engine;
pub use scheduler::{QueueStatus, QueuedExecution, SchedulerEvent, TaskScheduler};
