//! Request Batching
//!
//! Requests for the same worker arriving within a short window share one
//! flush timer. When it fires, requests with identical payloads are folded
//! into a single worker invocation whose result fans out to every waiter;
//! distinct payloads get their own invocation, run concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::join_all;
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::BatchError;
use crate::events::EventBus;
use crate::worker::Worker;

use super::{request_key, PerformanceEvent};

/// Summary of one flush.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub worker_id: String,
    /// Requests answered by this flush
    pub requests: usize,
    /// Worker invocations made (one per distinct payload)
    pub invocations: usize,
    /// Invocations that failed
    pub errors: usize,
    pub duration: Duration,
}

type Waiter = oneshot::Sender<Result<Value, BatchError>>;

/// Requests with one normalized payload, waiting for a flush.
struct BatchGroup {
    key: String,
    payload: Value,
    waiters: Vec<Waiter>,
}

type Queues = Mutex<HashMap<String, Vec<BatchGroup>>>;

#[derive(Debug, Default)]
struct BatchStats {
    batches: AtomicU64,
    total_nanos: AtomicU64,
    failed_invocations: AtomicU64,
}

/// Collects requests per worker and flushes them after a window.
pub struct Batcher {
    queues: Arc<Queues>,
    stats: Arc<BatchStats>,
    events: EventBus<PerformanceEvent>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Batcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("pending", &self.pending())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Batcher {
    /// Creates a batcher publishing `BatchProcessed` on `events`.
    pub fn new(events: EventBus<PerformanceEvent>) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(BatchStats::default()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    /// Queues `request` for `worker` and resolves once its batch is
    /// serviced.
    ///
    /// The first request for a worker starts the flush timer; later
    /// requests within `window` join that batch.
    pub async fn submit(
        &self,
        worker_id: &str,
        worker: Arc<dyn Worker>,
        request: Value,
        window: Duration,
    ) -> Result<Value, BatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BatchError::ShuttingDown);
        }

        let key = request_key(worker_id, &request);
        let (tx, rx) = oneshot::channel();

        let start_timer = {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            let groups = queues.entry(worker_id.to_string()).or_default();
            let first = groups.is_empty();
            match groups.iter_mut().find(|g| g.key == key) {
                Some(group) => group.waiters.push(tx),
                None => groups.push(BatchGroup {
                    key,
                    payload: request,
                    waiters: vec![tx],
                }),
            }
            first
        };

        if start_timer {
            debug!("Opening batch window for worker '{}'", worker_id);
            tokio::spawn(flush_after(
                self.queues.clone(),
                self.stats.clone(),
                self.events.clone(),
                worker_id.to_string(),
                worker,
                window,
            ));
        }

        rx.await
            .unwrap_or_else(|_| Err(BatchError::Dropped(worker_id.to_string())))
    }

    /// Requests currently waiting for a flush.
    pub fn pending(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flat_map(|groups| groups.iter().map(|g| g.waiters.len()))
            .sum()
    }

    pub fn batches_processed(&self) -> u64 {
        self.stats.batches.load(Ordering::Relaxed)
    }

    /// Worker invocations that returned an error.
    pub fn failed_invocations(&self) -> u64 {
        self.stats.failed_invocations.load(Ordering::Relaxed)
    }

    /// Mean flush duration, zero before the first flush.
    pub fn average_batch_time(&self) -> Duration {
        let batches = self.batches_processed();
        if batches == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.stats.total_nanos.load(Ordering::Relaxed) / batches)
    }

    /// Rejects new requests and fails every queued one.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<BatchGroup> = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .flat_map(|(_, groups)| groups)
            .collect();

        for group in drained {
            for waiter in group.waiters {
                let _ = waiter.send(Err(BatchError::ShuttingDown));
            }
        }
    }
}

async fn flush_after(
    queues: Arc<Queues>,
    stats: Arc<BatchStats>,
    events: EventBus<PerformanceEvent>,
    worker_id: String,
    worker: Arc<dyn Worker>,
    window: Duration,
) {
    tokio::time::sleep(window).await;

    let groups = queues
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&worker_id)
        .unwrap_or_default();
    if groups.is_empty() {
        return;
    }

    let started = Instant::now();
    let requests: usize = groups.iter().map(|g| g.waiters.len()).sum();
    let invocations = groups.len();

    let outcomes = join_all(groups.iter().map(|g| worker.process(g.payload.clone()))).await;

    let mut errors = 0;
    for (group, outcome) in groups.into_iter().zip(outcomes) {
        let result = match outcome {
            Ok(value) => Ok(value),
            Err(e) => {
                errors += 1;
                warn!("Batched request for worker '{}' failed: {}", worker_id, e);
                Err(BatchError::Processing {
                    worker_id: worker_id.clone(),
                    message: e.message,
                })
            }
        };
        for waiter in group.waiters {
            // The waiter may have timed out and gone away
            let _ = waiter.send(result.clone());
        }
    }

    let duration = started.elapsed();
    stats.batches.fetch_add(1, Ordering::Relaxed);
    stats
        .total_nanos
        .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    stats
        .failed_invocations
        .fetch_add(errors as u64, Ordering::Relaxed);

    debug!(
        "Flushed batch for '{}': {} requests, {} invocations, {} errors",
        worker_id, requests, invocations, errors
    );
    events.emit(PerformanceEvent::BatchProcessed(BatchReport {
        worker_id,
        requests,
        invocations,
        errors,
        duration,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::worker::{EchoWorker, FnWorker};
    use serde_json::json;

    const WINDOW: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_identical_requests_fold_into_one_invocation() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let batcher = Batcher::new(events);
        let worker = Arc::new(EchoWorker::new("echo"));

        let (a, b, c) = tokio::join!(
            batcher.submit("echo", worker.clone(), json!({"q": 1}), WINDOW),
            batcher.submit("echo", worker.clone(), json!({"q": 1}), WINDOW),
            batcher.submit("echo", worker.clone(), json!({"q": 1}), WINDOW),
        );

        assert_eq!(a.unwrap(), json!({"q": 1}));
        assert_eq!(b.unwrap(), json!({"q": 1}));
        assert_eq!(c.unwrap(), json!({"q": 1}));
        assert_eq!(worker.calls(), 1);
        assert_eq!(batcher.batches_processed(), 1);

        match rx.recv().await.unwrap() {
            PerformanceEvent::BatchProcessed(report) => {
                assert_eq!(report.requests, 3);
                assert_eq!(report.invocations, 1);
                assert_eq!(report.errors, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_distinct_payloads_get_their_own_results() {
        let batcher = Batcher::new(EventBus::new(16));
        let worker = Arc::new(EchoWorker::new("echo"));

        let (a, b) = tokio::join!(
            batcher.submit("echo", worker.clone(), json!("first"), WINDOW),
            batcher.submit("echo", worker.clone(), json!("second"), WINDOW),
        );

        assert_eq!(a.unwrap(), json!("first"));
        assert_eq!(b.unwrap(), json!("second"));
        assert_eq!(worker.calls(), 2);
        assert_eq!(batcher.batches_processed(), 1);
    }

    #[tokio::test]
    async fn test_failure_rejects_every_folded_waiter() {
        let batcher = Batcher::new(EventBus::new(16));
        let worker: Arc<dyn Worker> = Arc::new(FnWorker::new("bad", |_| async {
            Err::<Value, _>(WorkerError::new("model overloaded"))
        }));

        let (a, b) = tokio::join!(
            batcher.submit("bad", worker.clone(), json!(1), WINDOW),
            batcher.submit("bad", worker.clone(), json!(1), WINDOW),
        );

        let expected = BatchError::Processing {
            worker_id: "bad".to_string(),
            message: "model overloaded".to_string(),
        };
        assert_eq!(a.unwrap_err(), expected);
        assert_eq!(b.unwrap_err(), expected);
        assert_eq!(batcher.failed_invocations(), 1);
    }

    #[tokio::test]
    async fn test_new_window_after_flush() {
        let batcher = Batcher::new(EventBus::new(16));
        let worker = Arc::new(EchoWorker::new("echo"));

        batcher
            .submit("echo", worker.clone(), json!(1), WINDOW)
            .await
            .unwrap();
        batcher
            .submit("echo", worker.clone(), json!(1), WINDOW)
            .await
            .unwrap();

        assert_eq!(worker.calls(), 2);
        assert_eq!(batcher.batches_processed(), 2);
        assert_eq!(batcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_queued_and_new_requests() {
        let batcher = Arc::new(Batcher::new(EventBus::new(16)));
        let worker = Arc::new(EchoWorker::new("echo"));

        let queued = {
            let batcher = batcher.clone();
            let worker = worker.clone();
            tokio::spawn(async move {
                batcher
                    .submit("echo", worker, json!(1), Duration::from_secs(60))
                    .await
            })
        };

        while batcher.pending() == 0 {
            tokio::task::yield_now().await;
        }
        batcher.shutdown();

        assert_eq!(queued.await.unwrap(), Err(BatchError::ShuttingDown));
        assert_eq!(
            batcher.submit("echo", worker, json!(2), WINDOW).await,
            Err(BatchError::ShuttingDown)
        );
    }
}
