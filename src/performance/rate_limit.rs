//! Rate Limiting
//!
//! Fixed-window request counters keyed by an arbitrary string (normally
//! the worker ID).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Counter for one key's current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub count: u32,
    /// `None` when the window reaches past what `Instant` can represent
    pub reset_at: Option<Instant>,
}

impl RateLimitWindow {
    fn is_open(&self, now: Instant) -> bool {
        self.reset_at.map_or(true, |at| now <= at)
    }
}

/// Fixed-window rate limiter.
///
/// Each key gets a window of length `window` starting at its first
/// request. Within the window at most `max_requests` are allowed; once the
/// window has passed, the next request opens a fresh one.
///
/// Windows are not sliding: a client can spend its whole budget at the end
/// of one window and again at the start of the next, briefly reaching up
/// to twice the nominal rate. That burst is accepted in exchange for O(1)
/// state per key.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, RateLimitWindow>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request for `key` and returns whether it is allowed.
    ///
    /// `max_requests == 0` denies everything.
    pub fn check(&self, key: &str, max_requests: u32, window: Duration) -> bool {
        if max_requests == 0 {
            return false;
        }

        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(w) = windows.get_mut(key) {
            if w.is_open(now) {
                if w.count >= max_requests {
                    return false;
                }
                w.count += 1;
                return true;
            }
        }

        windows.insert(
            key.to_string(),
            RateLimitWindow {
                count: 1,
                reset_at: now.checked_add(window),
            },
        );
        true
    }

    /// Current window for `key`, if one is open.
    pub fn window(&self, key: &str) -> Option<RateLimitWindow> {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Drops windows that have already ended. Returns how many.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, w| w.is_open(now));
        before - windows.len()
    }

    /// Number of keys with a tracked window.
    pub fn len(&self) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
