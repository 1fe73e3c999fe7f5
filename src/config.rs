//! Runtime Configuration
//!
//! Construction-time settings for the scheduler, performance manager and
//! monitor, loaded from YAML. Every field has a default, so an empty file
//! (or no file) yields a usable configuration.
//!
//! ```yaml
//! scheduler:
//!   max_concurrent_workflows: 3
//!   queue_timeout_ms: 1800000
//! performance:
//!   rate_limit: { max_requests: 60, window_ms: 60000 }
//! monitor:
//!   slow_operation_threshold_ms: 1000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub performance: PerformanceConfig,
    pub monitor: MonitorConfig,
}

/// Task scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Workflows allowed to run at once
    pub max_concurrent_workflows: usize,
    /// Running time after which the sweep fails a workflow
    pub queue_timeout_ms: u64,
    /// Re-enqueue failed workflows
    pub retry_failed_tasks: bool,
    /// Re-enqueues allowed per workflow
    pub max_retries: u32,
    /// Period of the stuck-workflow sweep
    pub sweep_interval_ms: u64,
}

impl SchedulerConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 3,
            queue_timeout_ms: 1_800_000,
            retry_failed_tasks: true,
            max_retries: 3,
            sweep_interval_ms: 300_000,
        }
    }
}

/// Fixed-window rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_ms: 60_000,
        }
    }
}

/// Performance manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Default lifetime of a cached response
    pub cache_ttl_ms: u64,
    /// How long a batch collects requests before flushing
    pub batch_window_ms: u64,
    pub enable_caching: bool,
    pub enable_batching: bool,
    /// Per-worker limit; `None` disables rate limiting
    pub rate_limit: Option<RateLimitConfig>,
    /// Period of the cache and rate-limit sweep
    pub maintenance_interval_ms: u64,
}

impl PerformanceConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 300_000,
            batch_window_ms: 100,
            enable_caching: true,
            enable_batching: true,
            rate_limit: Some(RateLimitConfig::default()),
            maintenance_interval_ms: 60_000,
        }
    }
}

/// Metrics and resource monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Operations slower than this emit `SlowOperation`
    pub slow_operation_threshold_ms: u64,
    /// Active operations allowed before backpressure
    pub max_concurrent_operations: usize,
    pub resource_sampling_interval_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Age after which metrics are pruned
    pub retention_ms: u64,
    /// Hard cap on stored metrics
    pub max_metrics: usize,
    /// Resident memory above which a sample emits `HighMemory`; `None`
    /// disables the check
    pub memory_warning_bytes: Option<u64>,
}

impl MonitorConfig {
    pub fn slow_operation_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_operation_threshold_ms)
    }

    pub fn resource_sampling_interval(&self) -> Duration {
        Duration::from_millis(self.resource_sampling_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_operation_threshold_ms: 1_000,
            max_concurrent_operations: 50,
            resource_sampling_interval_ms: 5_000,
            cleanup_interval_ms: 300_000,
            retention_ms: 3_600_000,
            max_metrics: 1_000,
            memory_warning_bytes: Some(500 * 1024 * 1024),
        }
    }
}

fn require(condition: bool, message: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Invalid(message.to_string()))
    }
}

impl SchedulerConfig {
    /// Rejects values the scheduler cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(
            self.max_concurrent_workflows >= 1,
            "scheduler.max_concurrent_workflows must be at least 1",
        )?;
        require(
            self.queue_timeout_ms > 0,
            "scheduler.queue_timeout_ms must be greater than 0",
        )?;
        require(
            self.sweep_interval_ms > 0,
            "scheduler.sweep_interval_ms must be greater than 0",
        )
    }
}

impl PerformanceConfig {
    /// Rejects values the performance manager cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(self.cache_ttl_ms > 0, "performance.cache_ttl_ms must be greater than 0")?;
        require(
            self.maintenance_interval_ms > 0,
            "performance.maintenance_interval_ms must be greater than 0",
        )?;
        if let Some(limit) = &self.rate_limit {
            require(
                limit.window_ms > 0,
                "performance.rate_limit.window_ms must be greater than 0",
            )?;
        }
        Ok(())
    }
}

impl MonitorConfig {
    /// Rejects values the monitor cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(
            self.max_concurrent_operations >= 1,
            "monitor.max_concurrent_operations must be at least 1",
        )?;
        require(
            self.resource_sampling_interval_ms > 0,
            "monitor.resource_sampling_interval_ms must be greater than 0",
        )?;
        require(
            self.cleanup_interval_ms > 0,
            "monitor.cleanup_interval_ms must be greater than 0",
        )?;
        require(self.max_metrics >= 1, "monitor.max_metrics must be at least 1")?;
        if let Some(threshold) = self.memory_warning_bytes {
            require(threshold > 0, "monitor.memory_warning_bytes must be greater than 0")?;
        }
        Ok(())
    }
}

impl RuntimeConfig {
    /// Checks every section for values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        self.performance.validate()?;
        self.monitor.validate()
    }
}

/// Parses and validates a configuration from YAML text.
pub fn parse_config(yaml: &str) -> Result<RuntimeConfig, ConfigError> {
    // serde_yaml rejects an empty document; treat it as all defaults
    let config: RuntimeConfig = if yaml.trim().is_empty() {
        RuntimeConfig::default()
    } else {
        serde_yaml::from_str(yaml)?
    };
    config.validate()?;
    debug!("Configuration: {:?}", config);
    Ok(config)
}

/// Loads and validates a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<RuntimeConfig, ConfigError> {
    let path = path.as_ref();
    info!("Loading configuration from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&content)
}
