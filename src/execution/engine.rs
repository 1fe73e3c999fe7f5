//! Workflow Execution Engine
//!
//! Runs one workflow's step graph to completion:
//! - Dependency resolution through the [`ExecutionPlanner`]
//! - Sequential or grouped parallel dispatch, capped per group
//! - Step timeouts and retries (see [`super::step`])
//! - Cooperative cancellation through a [`CancellationToken`]

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::error::{ExecutionError, StructuralError};
use crate::monitoring::MetricsMonitor;
use crate::performance::PerformanceManager;
use crate::worker::WorkerRegistry;
use crate::workflow::{ExecutionPlanner, Workflow, WorkflowStatus};

use super::step::{execute_step, StepContext};

/// Workflow execution engine.
///
/// Holds the collaborators every run needs; a single engine can execute
/// any number of workflows concurrently.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use agentrunner::execution::Engine;
/// use agentrunner::worker::{EchoWorker, WorkerRegistry};
/// use agentrunner::load_workflow;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = Arc::new(WorkerRegistry::new());
///     registry.register(Arc::new(EchoWorker::new("echo")))?;
///
///     let workflow = load_workflow("pipeline.yaml")?;
///     let engine = Engine::new(registry);
///     engine.execute(&workflow, CancellationToken::new()).await?;
///     Ok(())
/// }
/// ```
pub struct Engine {
    registry: Arc<WorkerRegistry>,
    performance: Option<Arc<PerformanceManager>>,
    monitor: Option<Arc<MetricsMonitor>>,
}

impl Engine {
    /// Creates an engine that calls workers directly.
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            registry,
            performance: None,
            monitor: None,
        }
    }

    /// Routes worker calls through a performance manager.
    pub fn with_performance(mut self, performance: Arc<PerformanceManager>) -> Self {
        self.performance = Some(performance);
        self
    }

    /// Tracks every step with a metrics monitor.
    pub fn with_monitor(mut self, monitor: Arc<MetricsMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn performance(&self) -> Option<&Arc<PerformanceManager>> {
        self.performance.as_ref()
    }

    pub fn monitor(&self) -> Option<&Arc<MetricsMonitor>> {
        self.monitor.as_ref()
    }

    /// Executes a pending workflow.
    ///
    /// The workflow ends `completed`, `failed` or `cancelled`; the same
    /// outcome is returned. A workflow already moved to a terminal state by
    /// someone else (such as the scheduler's timeout sweep) keeps it.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        cancel: CancellationToken,
    ) -> Result<(), ExecutionError> {
        workflow
            .begin_run()
            .map_err(|status| ExecutionError::NotPending {
                workflow_id: workflow.id().to_string(),
                status,
            })?;

        let config = workflow.config();
        info!(
            "Starting workflow '{}' ({}): {} steps, {}",
            workflow.name(),
            workflow.id(),
            workflow.len(),
            if config.parallel {
                format!("parallel (max {})", config.max_concurrent_steps)
            } else {
                "sequential".to_string()
            }
        );

        let start = Instant::now();
        let outcome = self.run_graph(workflow, &cancel).await;

        match &outcome {
            Ok(()) => {
                workflow.finish_if_running(WorkflowStatus::Completed, None);
                info!(
                    "Workflow '{}' completed in {:.2}s",
                    workflow.name(),
                    start.elapsed().as_secs_f64()
                );
            }
            Err(ExecutionError::Cancelled(_)) => {
                workflow.finish_if_running(
                    WorkflowStatus::Cancelled,
                    Some("execution cancelled".to_string()),
                );
                info!("Workflow '{}' cancelled", workflow.name());
            }
            Err(e) => {
                workflow.finish_if_running(WorkflowStatus::Failed, Some(e.to_string()));
                error!("Workflow '{}' failed: {}", workflow.name(), e);
            }
        }

        outcome
    }

    async fn run_graph(
        &self,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        let config = workflow.config();
        let steps = workflow.steps();
        let limit = if config.parallel {
            config.max_concurrent_steps
        } else {
            1
        };

        let ctx = StepContext {
            registry: &self.registry,
            performance: self.performance.as_deref(),
            monitor: self.monitor.as_deref(),
        };

        let mut planner = ExecutionPlanner::new(workflow);

        loop {
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled(workflow.id().to_string()));
            }

            let group = planner.ready_steps(limit);
            if group.is_empty() {
                if planner.has_work_remaining() {
                    let remaining = planner.unresolved();
                    error!(
                        "Workflow '{}' stalled with unresolved steps: {:?}",
                        workflow.name(),
                        remaining
                    );
                    return Err(StructuralError::Unschedulable { remaining }.into());
                }
                return Ok(());
            }

            for &index in &group {
                planner.mark_step_running(index);
                debug!(
                    "Dispatching step '{}' to worker '{}'",
                    steps[index].id, steps[index].worker_id
                );
            }

            let results = join_all(
                group
                    .iter()
                    .map(|&index| execute_step(ctx, &steps[index], config, cancel)),
            )
            .await;

            let mut first_failure = None;
            for (&index, result) in group.iter().zip(results) {
                let step = &steps[index];
                match &result.outcome {
                    Ok(_) => {
                        debug!(
                            "Step '{}' completed in {}ms",
                            step.id,
                            result.duration.as_millis()
                        );
                        planner.mark_step_completed(index);
                    }
                    Err(e) => {
                        error!("Step '{}' failed: {}", step.id, e);
                        planner.mark_step_failed(index, e.clone());
                        if first_failure.is_none() {
                            first_failure = Some((step.id.clone(), e.clone()));
                        }
                    }
                }
                workflow.set_step_result(&step.id, result)?;
            }

            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled(workflow.id().to_string()));
            }

            if let Some((step_id, source)) = first_failure {
                if config.stop_on_error {
                    return Err(ExecutionError::StepFailed { step_id, source });
                }
            }

            let (done, total) = planner.progress();
            debug!("Workflow '{}' progress: {}/{}", workflow.name(), done, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MonitorConfig, PerformanceConfig};
    use crate::error::{StepError, WorkerError};
    use crate::worker::{EchoWorker, FnWorker};
    use crate::workflow::{RetryPolicy, WorkflowConfig, WorkflowEvent, WorkflowStep};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records dispatch and completion order while echoing its input.
    struct Recorder {
        log: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn worker(self: &Arc<Self>, id: &str, delay: Duration) -> Arc<FnWorker> {
            let recorder = self.clone();
            Arc::new(FnWorker::new(id, move |input| {
                let recorder = recorder.clone();
                async move {
                    let name = input["name"].as_str().unwrap_or("?").to_string();
                    let now = recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    recorder.peak.fetch_max(now, Ordering::SeqCst);
                    recorder.log.lock().unwrap().push(format!("start:{}", name));
                    tokio::time::sleep(delay).await;
                    recorder.log.lock().unwrap().push(format!("end:{}", name));
                    recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
                    if input["fail"].as_bool().unwrap_or(false) {
                        return Err(WorkerError::new(format!("{} failed", name)));
                    }
                    Ok(input)
                }
            }))
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn position(&self, entry: &str) -> usize {
            self.log().iter().position(|e| e == entry).unwrap()
        }
    }

    fn step(id: &str) -> WorkflowStep {
        WorkflowStep::new(id, "rec").with_input(json!({"name": id}))
    }

    fn failing(id: &str) -> WorkflowStep {
        WorkflowStep::new(id, "rec").with_input(json!({"name": id, "fail": true}))
    }

    fn no_retry() -> WorkflowConfig {
        WorkflowConfig::default().with_retry_policy(RetryPolicy::none())
    }

    fn engine_with(recorder: &Arc<Recorder>, delay: Duration) -> Engine {
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(recorder.worker("rec", delay)).unwrap();
        Engine::new(registry)
    }

    #[tokio::test]
    async fn test_parallel_fan_in() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder, Duration::from_millis(30));

        let workflow = Workflow::new(
            "fan-in",
            vec![step("A"), step("B"), step("C").depends_on("A").depends_on("B")],
            no_retry().with_parallel(2),
        )
        .unwrap();

        engine.execute(&workflow, CancellationToken::new()).await.unwrap();

        assert_eq!(workflow.status(), WorkflowStatus::Completed);
        assert_eq!(workflow.completed_steps().len(), 3);
        // A and B overlap, C waits for both
        assert_eq!(recorder.peak.load(Ordering::SeqCst), 2);
        assert!(recorder.position("start:C") > recorder.position("end:A"));
        assert!(recorder.position("start:C") > recorder.position("end:B"));
        assert_eq!(
            workflow.step_result("C").unwrap().output(),
            Some(&json!({"name": "C"}))
        );
    }

    #[tokio::test]
    async fn test_dispatch_after_dependencies() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder, Duration::from_millis(5));

        let workflow = Workflow::new(
            "diamond",
            vec![
                step("root"),
                step("left").depends_on("root"),
                step("right").depends_on("root"),
                step("join").depends_on("left").depends_on("right"),
                step("tail").depends_on("join"),
            ],
            no_retry().with_parallel(4),
        )
        .unwrap();

        engine.execute(&workflow, CancellationToken::new()).await.unwrap();

        for s in workflow.steps() {
            for &dep in workflow.dependencies_of(workflow.step_index(&s.id).unwrap()) {
                let dep_id = &workflow.steps()[dep].id;
                assert!(
                    recorder.position(&format!("start:{}", s.id))
                        > recorder.position(&format!("end:{}", dep_id)),
                    "{} dispatched before {}",
                    s.id,
                    dep_id
                );
                let result = workflow.step_result(&s.id).unwrap();
                let dep_result = workflow.step_result(dep_id).unwrap();
                assert!(result.started_at >= dep_result.finished_at);
            }
        }
    }

    #[tokio::test]
    async fn test_sequential_declaration_order() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder, Duration::from_millis(1));

        let workflow = Workflow::new(
            "seq",
            vec![step("b").depends_on("a"), step("a"), step("c")],
            no_retry(),
        )
        .unwrap();

        engine.execute(&workflow, CancellationToken::new()).await.unwrap();

        assert_eq!(
            recorder.log(),
            vec!["start:a", "end:a", "start:b", "end:b", "start:c", "end:c"]
        );
        assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrency_cap_per_group() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder, Duration::from_millis(10));

        let steps = (0..7).map(|i| step(&format!("s{}", i))).collect();
        let workflow = Workflow::new("wide", steps, no_retry().with_parallel(3)).unwrap();

        engine.execute(&workflow, CancellationToken::new()).await.unwrap();

        assert_eq!(workflow.completed_steps().len(), 7);
        assert_eq!(recorder.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stop_on_error() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder, Duration::from_millis(1));

        let workflow = Workflow::new(
            "halting",
            vec![step("first"), failing("broken"), step("after").depends_on("broken"), step("last")],
            no_retry(),
        )
        .unwrap();

        let err = engine
            .execute(&workflow, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(&err, ExecutionError::StepFailed { step_id, .. } if step_id == "broken"));
        assert_eq!(workflow.status(), WorkflowStatus::Failed);
        assert!(workflow.error().unwrap().contains("broken failed"));
        assert!(workflow.step_result("after").is_none());
        assert!(workflow.step_result("last").is_none());
        assert!(!recorder.log().contains(&"start:last".to_string()));
    }

    #[tokio::test]
    async fn test_parallel_stop_on_error() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder, Duration::from_millis(5));

        let workflow = Workflow::new(
            "parallel-halting",
            vec![step("A"), failing("B"), step("C").depends_on("B")],
            no_retry().with_parallel(2),
        )
        .unwrap();

        let err = engine
            .execute(&workflow, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(&err, ExecutionError::StepFailed { step_id, .. } if step_id == "B"));
        assert_eq!(workflow.status(), WorkflowStatus::Failed);
        // A ran alongside B and keeps its result
        assert_eq!(
            workflow.step_result("A").unwrap().output(),
            Some(&json!({"name": "A"}))
        );
        assert!(workflow.step_result("B").unwrap().error().is_some());
        assert!(workflow.step_result("C").is_none());
        assert!(!recorder.log().contains(&"start:C".to_string()));
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder, Duration::from_millis(1));

        let workflow = Workflow::new(
            "tolerant",
            vec![failing("broken"), step("after").depends_on("broken"), step("other")],
            no_retry().with_stop_on_error(false),
        )
        .unwrap();

        engine.execute(&workflow, CancellationToken::new()).await.unwrap();

        assert_eq!(workflow.status(), WorkflowStatus::Completed);
        assert!(!workflow.step_result("broken").unwrap().is_success());
        assert!(workflow.step_result("after").unwrap().is_success());
        assert_eq!(
            workflow.completed_steps(),
            BTreeSet::from(["after".to_string(), "other".to_string()])
        );
    }

    #[tokio::test]
    async fn test_reset_and_rerun() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder, Duration::from_millis(1));

        let workflow = Workflow::new(
            "again",
            vec![step("a"), step("b").depends_on("a"), step("c").depends_on("a")],
            no_retry().with_parallel(2),
        )
        .unwrap();

        engine.execute(&workflow, CancellationToken::new()).await.unwrap();
        let first = workflow.completed_steps();

        let err = engine
            .execute(&workflow, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::NotPending {
                status: WorkflowStatus::Completed,
                ..
            }
        ));

        workflow.reset();
        assert!(workflow.results().is_empty());
        engine.execute(&workflow, CancellationToken::new()).await.unwrap();
        assert_eq!(workflow.completed_steps(), first);
    }

    #[tokio::test]
    async fn test_cancellation_marks_cancelled() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder, Duration::from_secs(5));

        let workflow = Workflow::new(
            "cancel",
            vec![step("slow"), step("next").depends_on("slow")],
            no_retry(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = engine.execute(&workflow, cancel).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled(_)));
        assert_eq!(workflow.status(), WorkflowStatus::Cancelled);
        assert_eq!(
            workflow.step_result("slow").unwrap().error(),
            Some(&StepError::Cancelled)
        );
        assert!(workflow.step_result("next").is_none());
    }

    #[tokio::test]
    async fn test_terminal_state_survives_cancel() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder, Duration::from_secs(5));
        let workflow = Arc::new(Workflow::new("swept", vec![step("slow")], no_retry()).unwrap());

        let cancel = CancellationToken::new();
        let (trigger, target) = (cancel.clone(), workflow.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            target.update_status(WorkflowStatus::Failed, Some("timed out".into()));
            trigger.cancel();
        });

        assert!(engine.execute(&workflow, cancel).await.is_err());
        assert_eq!(workflow.status(), WorkflowStatus::Failed);
        assert_eq!(workflow.error().as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn test_missing_worker_fails_workflow() {
        let engine = Engine::new(Arc::new(WorkerRegistry::new()));
        let workflow = Workflow::new(
            "orphan",
            vec![WorkflowStep::new("s", "nobody")],
            WorkflowConfig::default(),
        )
        .unwrap();

        let err = engine
            .execute(&workflow, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::StepFailed {
                source: StepError::WorkerNotFound(_),
                ..
            }
        ));
        assert_eq!(workflow.status(), WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_events_and_full_stack() {
        let registry = Arc::new(WorkerRegistry::new());
        registry.register(Arc::new(EchoWorker::new("echo"))).unwrap();
        let monitor = Arc::new(MetricsMonitor::new(MonitorConfig::default()).unwrap());
        let performance = Arc::new(
            PerformanceManager::new(PerformanceConfig {
                batch_window_ms: 5,
                ..PerformanceConfig::default()
            })
            .unwrap(),
        );
        let engine = Engine::new(registry)
            .with_performance(performance.clone())
            .with_monitor(monitor.clone());

        let workflow = Workflow::new(
            "observed",
            vec![
                WorkflowStep::new("one", "echo").with_input(json!("x")),
                WorkflowStep::new("two", "echo").with_input(json!("x")).depends_on("one"),
            ],
            WorkflowConfig::default(),
        )
        .unwrap();
        let mut events = workflow.subscribe();

        engine.execute(&workflow, CancellationToken::new()).await.unwrap();

        let mut completed = Vec::new();
        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                WorkflowEvent::StepCompleted { step_id, .. } => completed.push(step_id),
                WorkflowEvent::StatusChanged { to, .. } => statuses.push(to),
                WorkflowEvent::Reset { .. } => {}
            }
        }
        assert_eq!(completed, vec!["one", "two"]);
        assert_eq!(statuses, vec![WorkflowStatus::Running, WorkflowStatus::Completed]);

        // identical request served from cache the second time
        let stats = performance.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(monitor.get_metrics().summary.operation_counts["step:echo"], 2);
    }
}
