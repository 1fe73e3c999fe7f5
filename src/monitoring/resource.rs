//! Resource Usage Monitoring
//!
//! Samples CPU and memory usage of the current process for the metrics
//! monitor and end-of-run reports.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};

/// Samples kept when no explicit cap is set.
const DEFAULT_MAX_SAMPLES: usize = 1000;

/// A single resource usage sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    /// When this sample was taken
    pub timestamp: DateTime<Utc>,
    /// CPU usage percentage (0-100+, per core)
    pub cpu_usage: f32,
    /// Resident memory in bytes
    pub memory_bytes: u64,
    /// Virtual memory in bytes
    pub virtual_memory_bytes: u64,
}

impl ResourceSnapshot {
    /// Resident memory in megabytes.
    pub fn memory_mb(&self) -> u64 {
        self.memory_bytes / (1024 * 1024)
    }
}

/// Monitors system resource usage for the current process.
///
/// # Example
///
/// ```rust,no_run
/// use agentrunner::monitoring::ResourceMonitor;
/// use std::time::Duration;
/// use std::thread;
///
/// let mut monitor = ResourceMonitor::new();
///
/// // Take samples periodically
/// for _ in 0..5 {
///     monitor.sample();
///     thread::sleep(Duration::from_millis(500));
/// }
///
/// println!("{}", monitor.get_summary());
/// ```
pub struct ResourceMonitor {
    system: System,
    process_id: Option<Pid>,
    samples: VecDeque<ResourceSnapshot>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
    max_samples: usize,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("process_id", &self.process_id)
            .field("samples", &self.samples.len())
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

impl ResourceMonitor {
    /// Creates a new resource monitor for the current process.
    pub fn new() -> Self {
        let process_id = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Resource monitoring unavailable: {}", e);
                None
            }
        };

        Self {
            system: System::new(),
            process_id,
            samples: VecDeque::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Caps the number of stored samples; the oldest are dropped first.
    pub fn with_max_samples(mut self, max_samples: usize) -> Self {
        self.max_samples = max_samples.max(1);
        self
    }

    /// Takes a resource usage sample and returns it.
    ///
    /// The first call performs CPU warmup (required for accurate readings)
    /// and returns `None`. Subsequent calls are rate-limited by
    /// `min_interval`.
    pub fn sample(&mut self) -> Option<ResourceSnapshot> {
        let pid = self.process_id?;
        let now = Instant::now();

        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        // First call: warmup
        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return None;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return None;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        let process = self.system.process(pid)?;
        let snapshot = ResourceSnapshot {
            timestamp: Utc::now(),
            cpu_usage: process.cpu_usage(),
            memory_bytes: process.memory(),
            virtual_memory_bytes: process.virtual_memory(),
        };

        self.samples.push_back(snapshot.clone());
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        Some(snapshot)
    }

    /// Drops samples taken before `cutoff`. Returns how many.
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.samples.len();
        self.samples.retain(|s| s.timestamp >= cutoff);
        before - self.samples.len()
    }

    /// Returns a human-readable summary of resource usage.
    pub fn get_summary(&self) -> String {
        if self.samples.is_empty() {
            return "No resource data collected".to_string();
        }

        let max_memory = self.peak_memory_mb();
        let min_memory = self.samples.iter().map(|s| s.memory_mb()).min().unwrap_or(0);

        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak Memory: {} MB\n  Min Memory: {} MB\n  Samples: {}",
            self.average_cpu(),
            max_memory,
            min_memory,
            self.samples.len()
        )
    }

    /// Returns all collected samples, oldest first.
    pub fn get_samples(&self) -> Vec<ResourceSnapshot> {
        self.samples.iter().cloned().collect()
    }

    /// Returns the peak memory usage in MB.
    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb()).max().unwrap_or(0)
    }

    /// Returns the average CPU usage.
    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
