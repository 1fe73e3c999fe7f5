//! Performance Module
//!
//! Protects workers from overload. Sits between the engine and the
//! workers and applies, in order:
//!
//! - [`rate_limit`]: fixed-window request limits per worker
//! - [`cache`]: TTL response cache keyed by worker and payload
//! - [`batch`]: folding of identical requests within a short window
//!
//! [`manager::PerformanceManager`] composes the three.

pub mod batch;
pub mod cache;
pub mod manager;
pub mod rate_limit;

use std::time::Duration;

use serde_json::Value;

pub use batch::{BatchReport, Batcher};
pub use cache::{CacheEntry, CacheStats, ResponseCache};
pub use manager::{PerformanceManager, PerformanceStats};
pub use rate_limit::{RateLimitWindow, RateLimiter};

/// Notification published by the performance manager.
#[derive(Debug, Clone)]
pub enum PerformanceEvent {
    /// A request was denied by the rate limiter
    RateLimitWarning {
        key: String,
        max_requests: u32,
        window: Duration,
    },
    /// A batch was flushed
    BatchProcessed(BatchReport),
    /// Periodic statistics from the maintenance sweep
    Metrics(PerformanceStats),
}

/// Deterministic cache and batching key for a worker request.
///
/// `serde_json` maps keep their keys sorted, so objects with the same
/// content serialize identically regardless of insertion order.
pub fn request_key(worker_id: &str, payload: &Value) -> String {
    format!("{}:{}", worker_id, payload)
}

/// Duration as fractional milliseconds, for summaries.
pub(crate) fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_key_ignores_field_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": [1, 2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": [1, 2], "b": 1}"#).unwrap();
        assert_eq!(request_key("w", &a), request_key("w", &b));
    }

    #[test]
    fn test_request_key_distinguishes_workers_and_payloads() {
        assert_ne!(request_key("w1", &json!(1)), request_key("w2", &json!(1)));
        assert_ne!(request_key("w", &json!(1)), request_key("w", &json!("1")));
    }
}
