//! Built-in Workers
//!
//! - [`EchoWorker`]: returns its input, optionally after a delay. Used by
//!   the command-line runner and for smoke-testing workflows.
//! - [`FnWorker`]: wraps an async closure, handy for embedding and tests.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use serde_json::Value;

use crate::error::WorkerError;

use super::{Worker, WorkerState};

/// Shared lifecycle bookkeeping for the built-in workers.
#[derive(Debug, Default)]
struct Lifecycle {
    initialized: AtomicBool,
    stopped: AtomicBool,
    in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl Lifecycle {
    fn state(&self) -> WorkerState {
        if self.stopped.load(Ordering::SeqCst) {
            WorkerState::Stopped
        } else if self.in_flight.load(Ordering::SeqCst) > 0 {
            WorkerState::Busy
        } else if self.initialized.load(Ordering::SeqCst) {
            WorkerState::Idle
        } else {
            WorkerState::Uninitialized
        }
    }

    fn begin(&self) -> Result<InFlight<'_>, WorkerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(WorkerError::new("worker has been stopped"));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(InFlight(self))
    }
}

/// Decrements the in-flight count on drop, including when the request
/// future is dropped by a timeout.
struct InFlight<'a>(&'a Lifecycle);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Returns every input unchanged.
#[derive(Debug)]
pub struct EchoWorker {
    id: String,
    delay: Option<Duration>,
    lifecycle: Lifecycle,
}

impl EchoWorker {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            delay: None,
            lifecycle: Lifecycle::default(),
        }
    }

    /// Sleeps for `delay` before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `process` calls so far.
    pub fn calls(&self) -> usize {
        self.lifecycle.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for EchoWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn initialize(&self) -> Result<(), WorkerError> {
        self.lifecycle.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn process(&self, input: Value) -> Result<Value, WorkerError> {
        let _in_flight = self.lifecycle.begin()?;
        debug!("Echo worker '{}' processing request", self.id);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(input)
    }

    fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    async fn cleanup(&self) -> Result<(), WorkerError> {
        self.lifecycle.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

type ProcessFn = Box<dyn Fn(Value) -> BoxFuture<'static, Result<Value, WorkerError>> + Send + Sync>;
type InitFn = Box<dyn Fn() -> Result<(), WorkerError> + Send + Sync>;

/// A worker backed by an async closure.
///
/// # Example
///
/// ```
/// use agentrunner::worker::FnWorker;
/// use serde_json::json;
///
/// let doubler = FnWorker::new("doubler", |input| async move {
///     let n = input.as_i64().unwrap_or(0);
///     Ok(json!(n * 2))
/// });
/// ```
pub struct FnWorker {
    id: String,
    process: ProcessFn,
    init: Option<InitFn>,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for FnWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnWorker")
            .field("id", &self.id)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

impl FnWorker {
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkerError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            process: Box::new(move |input| f(input).boxed()),
            init: None,
            lifecycle: Lifecycle::default(),
        }
    }

    /// Runs `init` as the worker's one-time initialization.
    pub fn with_initializer<I>(mut self, init: I) -> Self
    where
        I: Fn() -> Result<(), WorkerError> + Send + Sync + 'static,
    {
        self.init = Some(Box::new(init));
        self
    }

    /// Number of `process` calls so far.
    pub fn calls(&self) -> usize {
        self.lifecycle.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for FnWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn initialize(&self) -> Result<(), WorkerError> {
        if let Some(init) = &self.init {
            init()?;
        }
        self.lifecycle.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn process(&self, input: Value) -> Result<Value, WorkerError> {
        let _in_flight = self.lifecycle.begin()?;
        (self.process)(input).await
    }

    fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    async fn cleanup(&self) -> Result<(), WorkerError> {
        self.lifecycle.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_echo_worker() {
        let worker = EchoWorker::new("echo");
        assert_eq!(worker.state(), WorkerState::Uninitialized);

        worker.initialize().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);

        let out = worker.process(json!({"q": "price"})).await.unwrap();
        assert_eq!(out, json!({"q": "price"}));
        assert_eq!(worker.calls(), 1);
    }

    #[tokio::test]
    async fn test_echo_worker_busy_while_delayed() {
        let worker = Arc::new(EchoWorker::new("slow").with_delay(Duration::from_millis(50)));
        let task = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.process(json!(1)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(worker.state(), WorkerState::Busy);

        task.await.unwrap().unwrap();
        assert_ne!(worker.state(), WorkerState::Busy);
    }

    #[tokio::test]
    async fn test_stopped_worker_rejects_requests() {
        let worker = EchoWorker::new("echo");
        worker.cleanup().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(worker.process(json!(null)).await.is_err());
    }

    #[tokio::test]
    async fn test_fn_worker() {
        let worker = FnWorker::new("upper", |input: Value| async move {
            input
                .as_str()
                .map(|s| json!(s.to_uppercase()))
                .ok_or_else(|| WorkerError::new("expected a string"))
        });

        assert_eq!(worker.process(json!("eth")).await.unwrap(), json!("ETH"));
        assert!(worker.process(json!(3)).await.is_err());
        assert_eq!(worker.calls(), 2);
    }

    #[tokio::test]
    async fn test_fn_worker_initializer_error() {
        let worker = FnWorker::new("w", |v| async move { Ok(v) })
            .with_initializer(|| Err(WorkerError::new("no api key")));
        assert_eq!(worker.initialize().await.unwrap_err().message, "no api key");
        assert_eq!(worker.state(), WorkerState::Uninitialized);
    }
}
