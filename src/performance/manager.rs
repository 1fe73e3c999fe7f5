//! Performance Manager
//!
//! Composes rate limiting, response caching and batching in front of the
//! workers. A dispatched request goes through:
//!
//! 1. rate limit (per worker ID; a denial is a `StepError::RateLimited`)
//! 2. cache lookup (a hit returns without touching the worker)
//! 3. batch (or a direct call when batching is disabled)
//! 4. cache store of a successful response
//!
//! A maintenance task sweeps expired cache entries and rate-limit windows
//! and publishes a `Metrics` event on each pass.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::PerformanceConfig;
use crate::error::{BatchError, ConfigError, StepError};
use crate::events::EventBus;
use crate::worker::Worker;

use super::{as_millis_f64, request_key, Batcher, PerformanceEvent, RateLimiter, ResponseCache};

/// Point-in-time performance statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub total_requests: u64,
    pub batches_processed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub cache_entries: usize,
    pub rate_limited: u64,
    pub errors: u64,
    /// Mean batch flush time in milliseconds
    pub average_batch_time: f64,
}

/// Batching, caching and rate limiting in front of the workers.
#[derive(Debug)]
pub struct PerformanceManager {
    config: PerformanceConfig,
    cache: ResponseCache<Value>,
    limiter: RateLimiter,
    batcher: Batcher,
    events: EventBus<PerformanceEvent>,
    total_requests: AtomicU64,
    rate_limited: AtomicU64,
    errors: AtomicU64,
    shutting_down: AtomicBool,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceManager {
    /// Fails with [`ConfigError::Invalid`] for a configuration with a zero
    /// TTL, window or maintenance period.
    pub fn new(config: PerformanceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let events = EventBus::default();
        Ok(Self {
            cache: ResponseCache::new(config.cache_ttl()),
            limiter: RateLimiter::new(),
            batcher: Batcher::new(events.clone()),
            events,
            config,
            total_requests: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            maintenance: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PerformanceConfig {
        &self.config
    }

    /// Returns a cached response, counting the hit or miss.
    pub fn get_cached(&self, key: &str) -> Option<Value> {
        self.cache.get(key)
    }

    /// Caches a response for `ttl`, or the configured default TTL.
    pub fn cache(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        self.cache.insert(key, value, ttl);
    }

    /// Batches a request to `worker`, resolving when its batch is serviced.
    ///
    /// `window` defaults to the configured batch window.
    pub async fn batch_request(
        &self,
        worker_id: &str,
        worker: Arc<dyn Worker>,
        request: Value,
        window: Option<Duration>,
    ) -> Result<Value, BatchError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BatchError::ShuttingDown);
        }
        let window = window.unwrap_or_else(|| self.config.batch_window());
        self.batcher.submit(worker_id, worker, request, window).await
    }

    /// Fixed-window rate check for `key`; see [`RateLimiter`].
    pub fn check_rate_limit(&self, key: &str, max_requests: u32, window: Duration) -> bool {
        self.limiter.check(key, max_requests, window)
    }

    /// Sends one request to a worker through the full pipeline.
    pub async fn dispatch(
        &self,
        worker_id: &str,
        worker: Arc<dyn Worker>,
        input: Value,
    ) -> Result<Value, StepError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(BatchError::ShuttingDown.into());
        }
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Some(limit) = self.config.rate_limit {
            if !self.check_rate_limit(worker_id, limit.max_requests, limit.window()) {
                warn!(
                    "Rate limit exceeded for worker '{}' ({} per {}ms)",
                    worker_id, limit.max_requests, limit.window_ms
                );
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
                self.events.emit(PerformanceEvent::RateLimitWarning {
                    key: worker_id.to_string(),
                    max_requests: limit.max_requests,
                    window: limit.window(),
                });
                return Err(StepError::RateLimited(worker_id.to_string()));
            }
        }

        let key = request_key(worker_id, &input);
        if self.config.enable_caching {
            if let Some(hit) = self.get_cached(&key) {
                debug!("Cache hit for worker '{}'", worker_id);
                return Ok(hit);
            }
        }

        let result = if self.config.enable_batching {
            self.batch_request(worker_id, worker, input, None)
                .await
                .map_err(StepError::from)
        } else {
            worker.process(input).await.map_err(StepError::from)
        };

        match &result {
            Ok(value) if self.config.enable_caching => self.cache(key, value.clone(), None),
            Ok(_) => {}
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    pub fn stats(&self) -> PerformanceStats {
        let cache = self.cache.stats();
        PerformanceStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            batches_processed: self.batcher.batches_processed(),
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            cache_hit_rate: cache.hit_rate,
            cache_entries: cache.entries,
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            average_batch_time: as_millis_f64(self.batcher.average_batch_time()),
        }
    }

    /// Runs one maintenance pass: purges expired cache entries and
    /// rate-limit windows, then publishes `Metrics`.
    ///
    /// Returns (cache entries removed, windows removed).
    pub fn run_maintenance(&self) -> (usize, usize) {
        let entries = self.cache.purge_expired();
        let windows = self.limiter.purge_expired();
        if entries > 0 || windows > 0 {
            debug!(
                "Maintenance removed {} cache entries, {} rate-limit windows",
                entries, windows
            );
        }
        self.events.emit(PerformanceEvent::Metrics(self.stats()));
        (entries, windows)
    }

    /// Spawns the periodic maintenance task. Calling it again is a no-op.
    pub fn start_maintenance(self: &Arc<Self>) {
        let mut slot = self.maintenance.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.config.maintenance_interval();
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                match manager.upgrade() {
                    Some(manager) => {
                        manager.run_maintenance();
                    }
                    None => break,
                }
            }
        }));
        info!("Performance maintenance every {}ms", period.as_millis());
    }

    /// Stops timers, fails queued batches, rejects new requests and clears
    /// all cached state.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(task) = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.batcher.shutdown();
        self.cache.clear();
        self.limiter.clear();
        info!("Performance manager shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PerformanceEvent> {
        self.events.subscribe()
    }
}

impl Drop for PerformanceManager {
    fn drop(&mut self) {
        if let Some(task) = self
            .maintenance
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
