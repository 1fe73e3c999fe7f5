//! Operation Metrics
//!
//! Records the start, end, duration and outcome of named operations,
//! flags slow ones, and samples process resources on an interval.
//!
//! - Bounded: metrics older than the retention horizon are pruned, and
//!   at most `max_metrics` are kept
//! - Backpressure: `start_operation` refuses once too many operations are
//!   active

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::MonitorConfig;
use crate::error::{ConfigError, MonitorError};
use crate::events::EventBus;
use crate::performance::as_millis_f64;

use super::resource::{ResourceMonitor, ResourceSnapshot};

/// Notification published by the monitor.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    SlowOperation {
        operation: String,
        duration: Duration,
        threshold: Duration,
    },
    ResourceUsage(ResourceSnapshot),
    /// A sample's resident memory exceeded `memory_warning_bytes`.
    HighMemory {
        memory_bytes: u64,
        threshold_bytes: u64,
    },
}

/// Proof that an operation was started; hand it back to `end_operation`.
#[derive(Debug)]
pub struct OperationToken {
    id: u64,
    operation: String,
    started: Instant,
}

impl OperationToken {
    pub fn operation(&self) -> &str {
        &self.operation
    }
}

/// One recorded operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationMetric {
    #[serde(skip)]
    id: u64,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub success: bool,
    pub error: Option<String>,
}

/// Aggregate over completed operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total_operations: usize,
    /// Mean duration in milliseconds
    pub average_duration: f64,
    pub success_rate: f64,
    pub operation_counts: BTreeMap<String, usize>,
    pub active_operations: usize,
}

/// Per-operation aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationStats {
    pub count: usize,
    /// Mean duration in milliseconds
    pub average_duration: f64,
    pub success_rate: f64,
}

/// Everything the monitor knows, as returned by `get_metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub metrics: Vec<OperationMetric>,
    pub resources: Vec<ResourceSnapshot>,
    pub summary: MetricsSummary,
}

#[derive(Debug, Default)]
struct MetricsState {
    metrics: VecDeque<OperationMetric>,
    active: HashSet<u64>,
    next_id: u64,
}

/// Operation timing and resource sampling.
#[derive(Debug)]
pub struct MetricsMonitor {
    config: MonitorConfig,
    state: Mutex<MetricsState>,
    resources: Mutex<ResourceMonitor>,
    events: EventBus<MonitorEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MetricsMonitor {
    /// Fails with [`ConfigError::Invalid`] for a configuration with a zero
    /// limit or period.
    pub fn new(config: MonitorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let resources = ResourceMonitor::new().with_max_samples(config.max_metrics);
        Ok(Self {
            config,
            state: Mutex::new(MetricsState::default()),
            resources: Mutex::new(resources),
            events: EventBus::default(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts timing `operation`.
    ///
    /// Fails with [`MonitorError::Backpressure`] when
    /// `max_concurrent_operations` operations are already active.
    pub fn start_operation(&self, operation: &str) -> Result<OperationToken, MonitorError> {
        let mut state = self.state();
        let limit = self.config.max_concurrent_operations;
        if state.active.len() >= limit {
            return Err(MonitorError::Backpressure {
                active: state.active.len(),
                limit,
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        state.active.insert(id);
        state.metrics.push_back(OperationMetric {
            id,
            operation: operation.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            duration: None,
            success: true,
            error: None,
        });
        while state.metrics.len() > self.config.max_metrics {
            state.metrics.pop_front();
        }

        Ok(OperationToken {
            id,
            operation: operation.to_string(),
            started: Instant::now(),
        })
    }

    /// Finishes an operation, recording failure if `error` is set.
    ///
    /// Emits `SlowOperation` when the duration exceeds the configured
    /// threshold. Returns the measured duration.
    pub fn end_operation(&self, token: OperationToken, error: Option<&str>) -> Duration {
        let duration = token.started.elapsed();
        {
            let mut state = self.state();
            state.active.remove(&token.id);
            // The metric may already have been evicted by the cap
            if let Some(metric) = state.metrics.iter_mut().rev().find(|m| m.id == token.id) {
                metric.ended_at = Some(Utc::now());
                metric.duration = Some(duration);
                metric.success = error.is_none();
                metric.error = error.map(str::to_string);
            }
        }

        let threshold = self.config.slow_operation_threshold();
        if duration > threshold {
            warn!(
                "Slow operation '{}': {}ms (threshold {}ms)",
                token.operation,
                duration.as_millis(),
                threshold.as_millis()
            );
            self.events.emit(MonitorEvent::SlowOperation {
                operation: token.operation,
                duration,
                threshold,
            });
        }
        duration
    }

    pub fn active_operations(&self) -> usize {
        self.state().active.len()
    }

    /// Raw metrics, resource snapshots and a summary.
    pub fn get_metrics(&self) -> MetricsReport {
        let (metrics, active) = {
            let state = self.state();
            (state.metrics.iter().cloned().collect::<Vec<_>>(), state.active.len())
        };

        let completed: Vec<&OperationMetric> =
            metrics.iter().filter(|m| m.ended_at.is_some()).collect();
        let mut operation_counts = BTreeMap::new();
        for m in &completed {
            *operation_counts.entry(m.operation.clone()).or_insert(0) += 1;
        }

        let summary = MetricsSummary {
            total_operations: completed.len(),
            average_duration: average_millis(&completed),
            success_rate: success_rate(&completed),
            operation_counts,
            active_operations: active,
        };

        let resources = self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_samples();

        MetricsReport {
            metrics,
            resources,
            summary,
        }
    }

    /// Average duration, success rate and count per operation name.
    pub fn operation_stats(&self) -> BTreeMap<String, OperationStats> {
        let state = self.state();
        let mut grouped: BTreeMap<String, Vec<&OperationMetric>> = BTreeMap::new();
        for m in state.metrics.iter().filter(|m| m.ended_at.is_some()) {
            grouped.entry(m.operation.clone()).or_default().push(m);
        }

        grouped
            .into_iter()
            .map(|(name, ms)| {
                let stats = OperationStats {
                    count: ms.len(),
                    average_duration: average_millis(&ms),
                    success_rate: success_rate(&ms),
                };
                (name, stats)
            })
            .collect()
    }

    /// Human-readable summary for end-of-run reports.
    pub fn get_summary(&self) -> String {
        let report = self.get_metrics();
        let mut output = format!(
            "Operations: {} completed, {} active, {:.1}% success, avg {:.1} ms\n",
            report.summary.total_operations,
            report.summary.active_operations,
            report.summary.success_rate * 100.0,
            report.summary.average_duration
        );
        for (name, stats) in self.operation_stats() {
            output.push_str(&format!(
                "  {:24} x{:<4} avg {:>8.1} ms  {:>5.1}% ok\n",
                name,
                stats.count,
                stats.average_duration,
                stats.success_rate * 100.0
            ));
        }
        output.push_str(
            &self
                .resources
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_summary(),
        );
        output
    }

    /// Drops completed metrics and resource samples older than the
    /// retention horizon. Returns how many metrics were removed.
    pub fn prune(&self) -> usize {
        let cutoff = chrono::Duration::from_std(self.config.retention())
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        match cutoff {
            Some(cutoff) => self.prune_before(cutoff),
            None => 0,
        }
    }

    fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let removed = {
            let mut state = self.state();
            let before = state.metrics.len();
            state
                .metrics
                .retain(|m| m.ended_at.is_none() || m.started_at >= cutoff);
            before - state.metrics.len()
        };
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .prune_before(cutoff);

        if removed > 0 {
            debug!("Pruned {} metrics", removed);
        }
        removed
    }

    /// Takes one resource sample and publishes it as `ResourceUsage`,
    /// followed by `HighMemory` when it is over the warning threshold.
    pub fn sample_resources(&self) -> Option<ResourceSnapshot> {
        let snapshot = self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sample()?;
        self.events.emit(MonitorEvent::ResourceUsage(snapshot.clone()));
        self.check_memory(&snapshot);
        Some(snapshot)
    }

    /// Emits `HighMemory` if `snapshot` exceeds `memory_warning_bytes`.
    /// Returns whether it did.
    fn check_memory(&self, snapshot: &ResourceSnapshot) -> bool {
        let Some(threshold_bytes) = self.config.memory_warning_bytes else {
            return false;
        };
        if snapshot.memory_bytes <= threshold_bytes {
            return false;
        }
        warn!(
            "High memory usage: {} MB (threshold {} MB)",
            snapshot.memory_mb(),
            threshold_bytes / (1024 * 1024)
        );
        self.events.emit(MonitorEvent::HighMemory {
            memory_bytes: snapshot.memory_bytes,
            threshold_bytes,
        });
        true
    }

    /// Spawns the resource sampler and the pruning sweep. Calling it again
    /// is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }

        tasks.push(spawn_periodic(
            Arc::downgrade(self),
            self.config.resource_sampling_interval(),
            |monitor| {
                monitor.sample_resources();
            },
        ));
        tasks.push(spawn_periodic(
            Arc::downgrade(self),
            self.config.cleanup_interval(),
            |monitor| {
                monitor.prune();
            },
        ));
        info!(
            "Monitor started (sampling every {}ms, pruning every {}ms)",
            self.config.resource_sampling_interval_ms, self.config.cleanup_interval_ms
        );
    }

    /// Stops the background tasks.
    pub fn shutdown(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }
}

impl Drop for MetricsMonitor {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

/// Runs `tick` every `period` until the monitor is dropped.
fn spawn_periodic<F>(monitor: Weak<MetricsMonitor>, period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(&MetricsMonitor) + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            match monitor.upgrade() {
                Some(monitor) => tick(&monitor),
                None => break,
            }
        }
    })
}

fn average_millis(metrics: &[&OperationMetric]) -> f64 {
    if metrics.is_empty() {
        return 0.0;
    }
    let total: f64 = metrics
        .iter()
        .filter_map(|m| m.duration)
        .map(as_millis_f64)
        .sum();
    total / metrics.len() as f64
}

fn success_rate(metrics: &[&OperationMetric]) -> f64 {
    if metrics.is_empty() {
        return 0.0;
    }
    metrics.iter().filter(|m| m.success).count() as f64 / metrics.len() as f64
}
