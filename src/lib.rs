//! AgentRunner - Workflow Orchestration for Agent Workers
//!
//! The task orchestration and performance-management core of an agent
//! platform. Work is described as a dependency graph of steps, each handled
//! by a long-lived worker; graphs are scheduled and executed with bounded
//! concurrency, retries and timeouts, while workers are shielded from
//! overload by batching, caching and rate limiting.
//!
//! # Architecture
//!
//! - [`workflow`]: Step graph model, validation, run state and YAML parsing
//! - [`execution`]: Task scheduler and orchestration engine
//! - [`performance`]: Request batching, response caching and rate limiting
//! - [`monitoring`]: Operation metrics, resource sampling and timelines
//! - [`worker`]: The worker trait, registry and built-in workers
//! - [`config`]: Runtime configuration loaded from YAML
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentrunner::config::SchedulerConfig;
//! use agentrunner::execution::{Engine, TaskScheduler};
//! use agentrunner::worker::{EchoWorker, WorkerRegistry};
//! use agentrunner::load_workflow;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Register the workers steps can target
//!     let registry = Arc::new(WorkerRegistry::new());
//!     registry.register(Arc::new(EchoWorker::new("echo")))?;
//!
//!     // Load a workflow from YAML
//!     let workflow = Arc::new(load_workflow("pipeline.yaml")?);
//!
//!     // Submit it for execution
//!     let engine = Arc::new(Engine::new(registry));
//!     let scheduler = TaskScheduler::new(SchedulerConfig::default(), engine)?;
//!     scheduler.enqueue(workflow)?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod monitoring;
pub mod performance;
pub mod worker;
pub mod workflow;

// Re-export commonly used types
pub use config::{load_config, RuntimeConfig};
pub use error::{ExecutionError, SchedulerError, StepError, StructuralError, WorkerError};
pub use execution::{Engine, TaskScheduler};
pub use performance::PerformanceManager;
pub use worker::{Worker, WorkerRegistry};
pub use workflow::{load_workflow, Workflow, WorkflowStep};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "AgentRunner";
