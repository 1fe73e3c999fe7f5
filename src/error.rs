//! Error Types
//!
//! Every failure the core can report, grouped by the layer that raises it.
//!
//! - [`StructuralError`]: malformed workflow graph, raised at construction
//! - [`StepError`]: a single step failed (worker error, timeout, ...)
//! - [`BatchError`]: one batched worker invocation failed
//! - [`ExecutionError`]: outcome of running one workflow through the engine
//! - [`SchedulerError`]: queue-level failures, including workflow timeouts

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::workflow::WorkflowStatus;

/// A malformed workflow graph.
///
/// Always fatal and never retried: a graph that fails these checks
/// cannot be executed safely.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum StructuralError {
    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("step has empty or whitespace-only ID")]
    EmptyStepId,

    #[error("duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("cyclic dependency detected: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("unknown step ID: '{0}'")]
    UnknownStep(String),

    #[error("no runnable steps but {} remain unresolved: {}", .remaining.len(), .remaining.join(", "))]
    Unschedulable { remaining: Vec<String> },

    #[error("invalid workflow configuration: {0}")]
    InvalidConfig(String),
}

/// Error returned by a worker's own operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct WorkerError {
    pub message: String,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A batched worker invocation failed; every request folded into it
/// receives a clone of this error.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum BatchError {
    #[error("batch for worker '{worker_id}' failed: {message}")]
    Processing { worker_id: String, message: String },

    #[error("batch for worker '{0}' was dropped before completion")]
    Dropped(String),

    #[error("performance manager is shutting down")]
    ShuttingDown,
}

/// Failure of a single workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum StepError {
    #[error("worker '{0}' is not registered")]
    WorkerNotFound(String),

    #[error("worker '{worker_id}' failed to initialize: {message}")]
    Initialization { worker_id: String, message: String },

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("step '{step_id}' timed out after {timeout_ms}ms")]
    Timeout { step_id: String, timeout_ms: u64 },

    #[error("rate limit exceeded for worker '{0}'")]
    RateLimited(String),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("input producer for step '{step_id}' failed: {message}")]
    Input { step_id: String, message: String },

    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    /// Returns true if retrying the step may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Worker(_) | Self::Timeout { .. } | Self::RateLimited(_) | Self::Batch(_)
        )
    }
}

impl From<WorkerError> for StepError {
    fn from(err: WorkerError) -> Self {
        Self::Worker(err.message)
    }
}

/// Outcome of running one workflow through the engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("workflow '{workflow_id}' is {status}, expected pending (call reset() to re-run)")]
    NotPending {
        workflow_id: String,
        status: WorkflowStatus,
    },

    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error("step '{step_id}' failed: {source}")]
    StepFailed {
        step_id: String,
        #[source]
        source: StepError,
    },

    #[error("workflow '{0}' was cancelled")]
    Cancelled(String),
}

/// Queue-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("workflow '{0}' is already queued or running")]
    AlreadyQueued(String),

    #[error("workflow '{workflow_id}' exceeded queue timeout after {}ms", .elapsed.as_millis())]
    Timeout {
        workflow_id: String,
        elapsed: Duration,
    },
}

/// Monitor refused to track an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("maximum concurrent operations reached ({active}/{limit})")]
    Backpressure { active: usize, limit: usize },
}

/// Invalid runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure loading a workflow definition from disk.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read workflow file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Structural(#[from] StructuralError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_error_display() {
        let err = StructuralError::DuplicateStepId("fetch".to_string());
        assert_eq!(err.to_string(), "duplicate step ID: 'fetch'");

        let err = StructuralError::CyclicDependency {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency detected: a -> b -> a");

        let err = StructuralError::Unschedulable {
            remaining: vec!["c".into()],
        };
        assert!(err.to_string().contains("1 remain unresolved: c"));
    }

    #[test]
    fn test_step_error_retryable() {
        assert!(StepError::Worker("boom".into()).is_retryable());
        assert!(StepError::Timeout {
            step_id: "s".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(StepError::RateLimited("w".into()).is_retryable());
        assert!(!StepError::WorkerNotFound("w".into()).is_retryable());
        assert!(!StepError::Cancelled.is_retryable());
        assert!(!StepError::Input {
            step_id: "s".into(),
            message: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_worker_error_converts_to_step_error() {
        let err: StepError = WorkerError::new("upstream 503").into();
        assert_eq!(err, StepError::Worker("upstream 503".to_string()));
    }

    #[test]
    fn test_scheduler_timeout_display() {
        let err = SchedulerError::Timeout {
            workflow_id: "wf-1".into(),
            elapsed: Duration::from_millis(1500),
        };
        assert!(err.to_string().contains("1500ms"));
    }
}
