//! Monitoring Module
//!
//! Provides utilities for tracking operation timings, process resource
//! usage and the execution timeline of workflow runs.
//!
//! # Components
//!
//! - [`MetricsMonitor`]: operation timing, slow-operation alerts, backpressure
//! - [`ResourceMonitor`]: CPU and memory usage sampling
//! - [`ExecutionTimeline`]: Step start/end timing for Gantt charts

pub mod metrics;
pub mod resource;
pub mod timeline;

pub use metrics::{
    MetricsMonitor, MetricsReport, MetricsSummary, MonitorEvent, OperationMetric, OperationStats,
    OperationToken,
};
pub use resource::{ResourceMonitor, ResourceSnapshot};
pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
