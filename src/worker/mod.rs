//! Worker Module
//!
//! Workers are the long-lived units that actually process step inputs
//! (model-backed agents, data fetchers, report writers). The core only
//! sees them through the [`Worker`] trait.
//!
//! - [`registry`]: Lookup by ID with lazy one-shot initialization
//! - [`builtin`]: Ready-made workers (`EchoWorker`, `FnWorker`)

pub mod builtin;
pub mod registry;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::WorkerError;

pub use builtin::{EchoWorker, FnWorker};
pub use registry::{WorkerHandle, WorkerRegistry};

/// Lifecycle state reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Uninitialized,
    Idle,
    Busy,
    Failed,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// A capability that processes JSON payloads.
///
/// `initialize` is called exactly once, by the registry, before the first
/// `process` call. `process` may be called concurrently.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Stable identifier steps refer to.
    fn id(&self) -> &str;

    /// One-time setup (connections, model warm-up, ...).
    async fn initialize(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Processes one request.
    async fn process(&self, input: Value) -> Result<Value, WorkerError>;

    /// Current lifecycle state.
    fn state(&self) -> WorkerState;

    /// Releases resources; the worker is not used afterwards.
    async fn cleanup(&self) -> Result<(), WorkerError> {
        Ok(())
    }
}
