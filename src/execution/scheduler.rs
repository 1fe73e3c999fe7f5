//! Task Scheduler
//!
//! Admits queued workflow executions FIFO up to a global concurrency cap
//! and runs each admitted workflow on its own tokio task. Failed
//! executions can be re-queued a bounded number of times, and a periodic
//! sweep fails executions that run longer than the queue timeout.
//!
//! Outcomes never propagate to the caller of [`TaskScheduler::enqueue`];
//! observe them through [`TaskScheduler::subscribe`] or by polling the
//! workflow's status.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{ConfigError, ExecutionError, SchedulerError};
use crate::events::EventBus;
use crate::workflow::{Workflow, WorkflowStatus};

use super::engine::Engine;

/// Lifecycle notifications from the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    WorkflowQueued { workflow_id: String, position: usize },
    WorkflowDequeued { workflow_id: String },
    WorkflowStarted { workflow_id: String },
    WorkflowCompleted { workflow_id: String, duration: Duration },
    WorkflowFailed { workflow_id: String, error: String },
    WorkflowRetrying { workflow_id: String, attempt: u32, max_retries: u32 },
    WorkflowTimeout { workflow_id: String, elapsed: Duration },
    QueuePaused { remaining: usize, running: usize },
    QueueResumed,
    QueueCleared { dropped: usize },
}

impl SchedulerEvent {
    /// True for events after which the workflow will not run again.
    pub fn is_final_for(&self, id: &str) -> bool {
        match self {
            Self::WorkflowCompleted { workflow_id, .. }
            | Self::WorkflowFailed { workflow_id, .. }
            | Self::WorkflowTimeout { workflow_id, .. }
            | Self::WorkflowDequeued { workflow_id } => workflow_id == id,
            _ => false,
        }
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub running: usize,
    pub total: usize,
    pub paused: bool,
}

/// A workflow waiting for admission.
#[derive(Debug, Clone)]
pub struct QueuedExecution {
    pub workflow: Arc<Workflow>,
    pub enqueued_at: Instant,
    pub retry_count: u32,
}

impl QueuedExecution {
    fn new(workflow: Arc<Workflow>, retry_count: u32) -> Self {
        Self {
            workflow,
            enqueued_at: Instant::now(),
            retry_count,
        }
    }
}

struct RunningExecution {
    execution: QueuedExecution,
    started: Instant,
    /// Distinguishes this admission from later ones of the same workflow
    ticket: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedExecution>,
    running: HashMap<String, RunningExecution>,
    paused: bool,
    next_ticket: u64,
}

impl QueueState {
    fn contains(&self, workflow_id: &str) -> bool {
        self.running.contains_key(workflow_id)
            || self.pending.iter().any(|q| q.workflow.id() == workflow_id)
    }
}

struct SchedulerInner {
    config: SchedulerConfig,
    engine: Arc<Engine>,
    state: Mutex<QueueState>,
    events: EventBus<SchedulerEvent>,
}

/// Schedules workflow executions on the tokio runtime.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use agentrunner::config::SchedulerConfig;
/// use agentrunner::execution::{Engine, TaskScheduler};
/// use agentrunner::worker::WorkerRegistry;
/// use agentrunner::load_workflow;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Arc::new(Engine::new(Arc::new(WorkerRegistry::new())));
///     let scheduler = TaskScheduler::new(SchedulerConfig::default(), engine)?;
///
///     let workflow = Arc::new(load_workflow("pipeline.yaml")?);
///     let position = scheduler.enqueue(workflow)?;
///     println!("queued at position {}", position);
///     Ok(())
/// }
/// ```
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Fails with [`ConfigError::Invalid`] for a configuration that could
    /// never admit or sweep a workflow.
    pub fn new(config: SchedulerConfig, engine: Arc<Engine>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                config,
                engine,
                state: Mutex::new(QueueState::default()),
                events: EventBus::default(),
            }),
            sweeper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    /// Queues a workflow and runs admission. Returns its queue position
    /// (1-based) at the time it was queued.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, workflow: Arc<Workflow>) -> Result<usize, SchedulerError> {
        let workflow_id = workflow.id().to_string();
        let position = {
            let mut state = self.inner.lock();
            if state.contains(&workflow_id) {
                return Err(SchedulerError::AlreadyQueued(workflow_id));
            }
            state.pending.push_back(QueuedExecution::new(workflow, 0));
            state.pending.len()
        };

        info!("Queued workflow {} at position {}", workflow_id, position);
        self.inner.events.emit(SchedulerEvent::WorkflowQueued {
            workflow_id,
            position,
        });

        self.start_sweeper();
        SchedulerInner::admit(&self.inner);
        Ok(position)
    }

    /// Removes a workflow that has not been admitted yet.
    pub fn dequeue(&self, workflow_id: &str) -> bool {
        let removed = {
            let mut state = self.inner.lock();
            let before = state.pending.len();
            state.pending.retain(|q| q.workflow.id() != workflow_id);
            state.pending.len() != before
        };

        if removed {
            info!("Dequeued workflow {}", workflow_id);
            self.inner.events.emit(SchedulerEvent::WorkflowDequeued {
                workflow_id: workflow_id.to_string(),
            });
        }
        removed
    }

    /// Stops admitting workflows. Running executions are unaffected.
    pub fn pause(&self) {
        let (remaining, running) = {
            let mut state = self.inner.lock();
            state.paused = true;
            (state.pending.len(), state.running.len())
        };
        info!(
            "Scheduler paused ({} queued, {} running)",
            remaining, running
        );
        self.inner
            .events
            .emit(SchedulerEvent::QueuePaused { remaining, running });
    }

    pub fn resume(&self) {
        self.inner.lock().paused = false;
        info!("Scheduler resumed");
        self.inner.events.emit(SchedulerEvent::QueueResumed);
        SchedulerInner::admit(&self.inner);
    }

    /// Drops every pending execution. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut state = self.inner.lock();
            let dropped = state.pending.len();
            state.pending.clear();
            dropped
        };
        info!("Scheduler queue cleared ({} dropped)", dropped);
        self.inner
            .events
            .emit(SchedulerEvent::QueueCleared { dropped });
        dropped
    }

    /// Cancels a running execution through its token, or dequeues it if it
    /// is still pending. Returns false if the workflow is unknown.
    pub fn cancel(&self, workflow_id: &str) -> bool {
        let token = self
            .inner
            .lock()
            .running
            .get(workflow_id)
            .map(|run| run.cancel.clone());

        match token {
            Some(token) => {
                info!("Cancelling workflow {}", workflow_id);
                token.cancel();
                true
            }
            None => self.dequeue(workflow_id),
        }
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.inner.lock();
        QueueStatus {
            queued: state.pending.len(),
            running: state.running.len(),
            total: state.pending.len() + state.running.len(),
            paused: state.paused,
        }
    }

    /// Fails every running execution older than the queue timeout and frees
    /// its slot. Returns the IDs of the swept workflows.
    pub fn sweep_stuck(&self) -> Vec<String> {
        SchedulerInner::sweep(&self.inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Spawns the periodic stuck-execution sweep. Calling it again is a
    /// no-op; `enqueue` calls it on first use.
    pub fn start_sweeper(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let inner: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval();
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match inner.upgrade() {
                    Some(inner) => {
                        SchedulerInner::sweep(&inner);
                    }
                    None => break,
                }
            }
        }));
        debug!("Stuck-workflow sweep every {}ms", period.as_millis());
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if let Some(task) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// What to do with a finished execution, decided under the queue lock.
enum Outcome {
    Completed(Duration),
    Retrying(u32),
    Failed(String),
}

/// Cancellation, a run that never started and a graph that cannot make
/// progress fail the same way on every attempt.
fn is_retryable(error: &ExecutionError) -> bool {
    !matches!(
        error,
        ExecutionError::Cancelled(_)
            | ExecutionError::NotPending { .. }
            | ExecutionError::Structural(_)
    )
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts queued executions while capacity allows.
    fn admit(inner: &Arc<Self>) {
        loop {
            let (execution, ticket, cancel) = {
                let mut state = inner.lock();
                if state.paused || state.running.len() >= inner.config.max_concurrent_workflows {
                    return;
                }
                let Some(execution) = state.pending.pop_front() else {
                    return;
                };

                state.next_ticket += 1;
                let ticket = state.next_ticket;
                let cancel = CancellationToken::new();
                state.running.insert(
                    execution.workflow.id().to_string(),
                    RunningExecution {
                        execution: execution.clone(),
                        started: Instant::now(),
                        ticket,
                        cancel: cancel.clone(),
                    },
                );
                (execution, ticket, cancel)
            };

            let workflow = execution.workflow;
            let workflow_id = workflow.id().to_string();
            info!(
                "Starting workflow {} (waited {}ms)",
                workflow_id,
                execution.enqueued_at.elapsed().as_millis()
            );
            inner.events.emit(SchedulerEvent::WorkflowStarted {
                workflow_id: workflow_id.clone(),
            });

            let task_inner = inner.clone();
            tokio::spawn(async move {
                let result = task_inner.engine.execute(&workflow, cancel).await;
                Self::finish(&task_inner, &workflow_id, ticket, result);
            });
        }
    }

    fn finish(inner: &Arc<Self>, workflow_id: &str, ticket: u64, result: Result<(), ExecutionError>) {
        let outcome = {
            let mut state = inner.lock();
            let current = state
                .running
                .get(workflow_id)
                .is_some_and(|run| run.ticket == ticket);
            if !current {
                debug!("Ignoring stale completion of workflow {}", workflow_id);
                return;
            }
            let Some(run) = state.running.remove(workflow_id) else {
                return;
            };

            match result {
                Ok(()) => Outcome::Completed(run.started.elapsed()),
                Err(e) => {
                    let retry_count = run.execution.retry_count;
                    if is_retryable(&e)
                        && inner.config.retry_failed_tasks
                        && retry_count < inner.config.max_retries
                    {
                        let workflow = run.execution.workflow;
                        workflow.reset();
                        state
                            .pending
                            .push_back(QueuedExecution::new(workflow, retry_count + 1));
                        Outcome::Retrying(retry_count + 1)
                    } else {
                        Outcome::Failed(e.to_string())
                    }
                }
            }
        };

        let workflow_id = workflow_id.to_string();
        match outcome {
            Outcome::Completed(duration) => {
                info!(
                    "Workflow {} completed in {}ms",
                    workflow_id,
                    duration.as_millis()
                );
                inner.events.emit(SchedulerEvent::WorkflowCompleted {
                    workflow_id,
                    duration,
                });
            }
            Outcome::Retrying(attempt) => {
                warn!(
                    "Retrying workflow {} (attempt {}/{})",
                    workflow_id, attempt, inner.config.max_retries
                );
                inner.events.emit(SchedulerEvent::WorkflowRetrying {
                    workflow_id,
                    attempt,
                    max_retries: inner.config.max_retries,
                });
            }
            Outcome::Failed(error) => {
                error!("Workflow {} failed: {}", workflow_id, error);
                inner
                    .events
                    .emit(SchedulerEvent::WorkflowFailed { workflow_id, error });
            }
        }

        Self::admit(inner);
    }

    fn sweep(inner: &Arc<Self>) -> Vec<String> {
        let timeout = inner.config.queue_timeout();
        let stuck: Vec<RunningExecution> = {
            let mut state = inner.lock();
            let ids: Vec<String> = state
                .running
                .iter()
                .filter(|(_, run)| run.started.elapsed() > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.running.remove(id))
                .collect()
        };

        let mut swept = Vec::with_capacity(stuck.len());
        for run in stuck {
            let workflow = &run.execution.workflow;
            let elapsed = run.started.elapsed();
            let err = SchedulerError::Timeout {
                workflow_id: workflow.id().to_string(),
                elapsed,
            };

            run.cancel.cancel();
            if !workflow.status().is_terminal() {
                workflow.update_status(WorkflowStatus::Failed, Some(err.to_string()));
            }

            error!("{}", err);
            inner.events.emit(SchedulerEvent::WorkflowTimeout {
                workflow_id: workflow.id().to_string(),
                elapsed,
            });
            swept.push(workflow.id().to_string());
        }

        if !swept.is_empty() {
            Self::admit(inner);
        }
        swept
    }
}
