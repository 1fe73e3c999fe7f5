//! Step Execution
//!
//! Runs one workflow step against its worker:
//! 1. Looks up the worker and initializes it on first use
//! 2. Resolves the step input (invoking the producer, if any)
//! 3. Calls the worker, through the performance manager when present,
//!    under the step deadline
//! 4. Retries retryable errors with exponential backoff
//!
//! The whole step is tracked by the monitor as `step:<worker_id>`.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;
use crate::monitoring::MetricsMonitor;
use crate::performance::PerformanceManager;
use crate::worker::{Worker, WorkerRegistry};
use crate::workflow::{StepResult, WorkflowConfig, WorkflowStep};

/// Collaborators a step needs to reach its worker.
#[derive(Clone, Copy)]
pub(crate) struct StepContext<'a> {
    pub registry: &'a WorkerRegistry,
    pub performance: Option<&'a PerformanceManager>,
    pub monitor: Option<&'a MetricsMonitor>,
}

/// Executes a step to a final result. Never panics on worker failure;
/// every error ends up in the returned [`StepResult`].
pub(crate) async fn execute_step(
    ctx: StepContext<'_>,
    step: &WorkflowStep,
    config: &WorkflowConfig,
    cancel: &CancellationToken,
) -> StepResult {
    let started_at = Utc::now();
    let start = Instant::now();

    let operation = format!("step:{}", step.worker_id);
    let token = ctx.monitor.and_then(|m| match m.start_operation(&operation) {
        Ok(token) => Some(token),
        Err(e) => {
            debug!("Step '{}' not tracked: {}", step.id, e);
            None
        }
    });

    let (outcome, attempts) = match prepare(ctx, step).await {
        Ok((worker, input)) => run_attempts(ctx, step, config, worker, input, cancel).await,
        Err(e) => (Err(e), 0),
    };

    if let (Some(monitor), Some(token)) = (ctx.monitor, token) {
        let error = outcome.as_ref().err().map(|e| e.to_string());
        monitor.end_operation(token, error.as_deref());
    }

    StepResult {
        outcome,
        started_at,
        finished_at: Utc::now(),
        duration: start.elapsed(),
        attempts,
    }
}

/// Finds and initializes the worker and resolves the input.
async fn prepare(
    ctx: StepContext<'_>,
    step: &WorkflowStep,
) -> Result<(Arc<dyn Worker>, Value), StepError> {
    let handle = ctx
        .registry
        .get(&step.worker_id)
        .ok_or_else(|| StepError::WorkerNotFound(step.worker_id.clone()))?;

    let worker = handle
        .ready()
        .await
        .map_err(|e| StepError::Initialization {
            worker_id: step.worker_id.clone(),
            message: e.message,
        })?
        .clone();

    let input = step.input.resolve().map_err(|message| StepError::Input {
        step_id: step.id.clone(),
        message,
    })?;

    Ok((worker, input))
}

async fn run_attempts(
    ctx: StepContext<'_>,
    step: &WorkflowStep,
    config: &WorkflowConfig,
    worker: Arc<dyn Worker>,
    input: Value,
    cancel: &CancellationToken,
) -> (Result<Value, StepError>, u32) {
    let policy = step.retry_policy.as_ref().unwrap_or(&config.retry_policy);
    let deadline = step.timeout().unwrap_or_else(|| config.timeout());
    let max_attempts = policy.max_attempts.max(1);

    let mut attempt = 0;
    loop {
        attempt += 1;
        debug!(
            "Step '{}' attempt {}/{} on worker '{}'",
            step.id, attempt, max_attempts, step.worker_id
        );

        let call = async {
            match ctx.performance {
                Some(performance) => {
                    performance
                        .dispatch(&step.worker_id, worker.clone(), input.clone())
                        .await
                }
                None => worker.process(input.clone()).await.map_err(StepError::from),
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            timed = tokio::time::timeout(deadline, call) => timed.unwrap_or_else(|_| {
                Err(StepError::Timeout {
                    step_id: step.id.clone(),
                    timeout_ms: deadline.as_millis() as u64,
                })
            }),
        };

        match result {
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "Step '{}' failed (attempt {}/{}): {}; retrying in {}ms",
                    step.id,
                    attempt,
                    max_attempts,
                    e,
                    delay.as_millis()
                );
                tokio::select! {
                    _ = cancel.cancelled() => return (Err(StepError::Cancelled), attempt),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            other => return (other, attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MonitorConfig, PerformanceConfig};
    use crate::error::WorkerError;
    use crate::worker::{EchoWorker, FnWorker};
    use crate::workflow::RetryPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_retries(max_attempts: u32) -> WorkflowConfig {
        WorkflowConfig::default().with_retry_policy(RetryPolicy {
            max_attempts,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            backoff_multiplier: 2.0,
        })
    }

    fn ctx(registry: &WorkerRegistry) -> StepContext<'_> {
        StepContext {
            registry,
            performance: None,
            monitor: None,
        }
    }

    /// Fails the first `failures` calls, then echoes.
    fn flaky(id: &str, failures: u32) -> (Arc<FnWorker>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let worker = FnWorker::new(id, move |input| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures {
                    Err(WorkerError::new(format!("transient failure {}", n + 1)))
                } else {
                    Ok(input)
                }
            }
        });
        (Arc::new(worker), calls)
    }

    #[tokio::test]
    async fn test_successful_step() {
        let registry = WorkerRegistry::new();
        registry.register(Arc::new(EchoWorker::new("echo"))).unwrap();

        let step = WorkflowStep::new("s", "echo").with_input(json!({"x": 1}));
        let result = execute_step(ctx(&registry), &step, &fast_retries(3), &CancellationToken::new()).await;

        assert_eq!(result.output(), Some(&json!({"x": 1})));
        assert_eq!(result.attempts, 1);
        assert!(result.finished_at >= result.started_at);
    }

    #[tokio::test]
    async fn test_missing_worker() {
        let registry = WorkerRegistry::new();
        let step = WorkflowStep::new("s", "ghost");
        let result = execute_step(ctx(&registry), &step, &fast_retries(3), &CancellationToken::new()).await;

        assert_eq!(result.error(), Some(&StepError::WorkerNotFound("ghost".into())));
        assert_eq!(result.attempts, 0);
    }

    #[tokio::test]
    async fn test_producer_input_and_failure() {
        let registry = WorkerRegistry::new();
        registry.register(Arc::new(EchoWorker::new("echo"))).unwrap();

        let step = WorkflowStep::new("s", "echo").with_producer(|| Ok(json!("lazy")));
        let result = execute_step(ctx(&registry), &step, &fast_retries(1), &CancellationToken::new()).await;
        assert_eq!(result.output(), Some(&json!("lazy")));

        let step = WorkflowStep::new("s", "echo").with_producer(|| Err("feed offline".into()));
        let result = execute_step(ctx(&registry), &step, &fast_retries(3), &CancellationToken::new()).await;
        assert!(matches!(result.error(), Some(StepError::Input { message, .. }) if message == "feed offline"));
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let registry = WorkerRegistry::new();
        let (worker, calls) = flaky("flaky", 2);
        registry.register(worker).unwrap();

        let step = WorkflowStep::new("s", "flaky").with_input(json!(7));
        let result = execute_step(ctx(&registry), &step, &fast_retries(3), &CancellationToken::new()).await;

        assert_eq!(result.output(), Some(&json!(7)));
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let registry = WorkerRegistry::new();
        let (worker, calls) = flaky("flaky", 10);
        registry.register(worker).unwrap();

        let step = WorkflowStep::new("s", "flaky").with_retry_policy(RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            backoff_multiplier: 1.0,
        });
        let result = execute_step(ctx(&registry), &step, &fast_retries(5), &CancellationToken::new()).await;

        assert_eq!(result.error(), Some(&StepError::Worker("transient failure 2".into())));
        assert_eq!(result.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let registry = WorkerRegistry::new();
        registry
            .register(Arc::new(EchoWorker::new("slow").with_delay(Duration::from_secs(5))))
            .unwrap();

        let step = WorkflowStep::new("s", "slow").with_timeout(Duration::from_millis(20));
        let result = execute_step(ctx(&registry), &step, &fast_retries(1), &CancellationToken::new()).await;

        assert_eq!(
            result.error(),
            Some(&StepError::Timeout {
                step_id: "s".into(),
                timeout_ms: 20
            })
        );
        assert!(result.duration < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let registry = WorkerRegistry::new();
        registry
            .register(Arc::new(EchoWorker::new("slow").with_delay(Duration::from_secs(5))))
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let step = WorkflowStep::new("s", "slow");
        let result = execute_step(ctx(&registry), &step, &fast_retries(3), &cancel).await;
        assert_eq!(result.error(), Some(&StepError::Cancelled));
    }

    #[tokio::test]
    async fn test_tracked_by_monitor_and_performance() {
        let registry = WorkerRegistry::new();
        registry.register(Arc::new(EchoWorker::new("echo"))).unwrap();
        let monitor = MetricsMonitor::new(MonitorConfig::default()).unwrap();
        let performance = PerformanceManager::new(PerformanceConfig {
            batch_window_ms: 5,
            ..PerformanceConfig::default()
        })
        .unwrap();

        let ctx = StepContext {
            registry: &registry,
            performance: Some(&performance),
            monitor: Some(&monitor),
        };
        let step = WorkflowStep::new("s", "echo").with_input(json!(1));
        let result = execute_step(ctx, &step, &fast_retries(1), &CancellationToken::new()).await;

        assert!(result.is_success());
        assert_eq!(performance.stats().total_requests, 1);
        let summary = monitor.get_metrics().summary;
        assert_eq!(summary.operation_counts["step:echo"], 1);
        assert_eq!(summary.active_operations, 0);
    }
}
