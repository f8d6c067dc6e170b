//! Sliding-window rate limiter with lockout.
//!
//! Counts requests per address inside a rolling window; exceeding the
//! threshold locks the address out for a fixed period. The count includes
//! the request being judged, so `max_requests = 3` admits exactly three
//! requests per window.

use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{admission::AdmissionCriterion, error::AdmissionError};

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Requests admitted per window (≥ 1)
    pub max_requests: usize,
    /// Window length in milliseconds (≥ 1)
    pub window_ms: u64,
    /// Lockout applied on violation, in seconds (0 disables the lockout)
    pub lockout_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_requests: 20, window_ms: 1_000, lockout_seconds: 60 }
    }
}

/// Per-address window state.
#[derive(Debug, Default)]
struct AddressWindow {
    /// Request timestamps inside the window, oldest first
    stamps: VecDeque<i64>,
    /// Lockout expiry; zero when not locked
    locked_until_ms: i64,
}

/// Sliding-window request counter with lockout.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<IpAddr, AddressWindow>>,
}

impl SlidingWindowLimiter {
    /// Create a limiter, validating the configuration invariants.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::InvalidConfig`] if `max_requests` or `window_ms`
    ///   is zero.
    pub fn new(config: RateLimitConfig) -> Result<Self, AdmissionError> {
        if config.max_requests == 0 {
            return Err(AdmissionError::InvalidConfig("max_requests must be at least 1"));
        }
        if config.window_ms == 0 {
            return Err(AdmissionError::InvalidConfig("window_ms must be at least 1"));
        }

        Ok(Self { config, windows: Mutex::new(HashMap::new()) })
    }

    /// Addresses currently carrying state (tests and diagnostics).
    #[must_use]
    pub fn tracked_addresses(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }

    fn judge(&self, addr: IpAddr, now_ms: i64) -> bool {
        let Ok(mut windows) = self.windows.lock() else {
            return false;
        };
        let window = windows.entry(addr).or_default();

        // Still locked out from an earlier violation.
        if window.locked_until_ms > now_ms {
            return true;
        }

        // Evict stamps strictly older than the window, then count this
        // request.
        let horizon = now_ms - self.config.window_ms as i64;
        while window.stamps.front().is_some_and(|&stamp| stamp < horizon) {
            window.stamps.pop_front();
        }
        window.stamps.push_back(now_ms);

        if window.stamps.len() > self.config.max_requests {
            window.locked_until_ms = now_ms + 1_000 * self.config.lockout_seconds as i64;
            return true;
        }

        false
    }
}

#[async_trait]
impl AdmissionCriterion for SlidingWindowLimiter {
    async fn validate(&self, addr: IpAddr, now_ms: i64) -> bool {
        self.judge(addr, now_ms)
    }

    fn clear(&self, addr: IpAddr) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.remove(&addr);
        }
    }

    fn purge_stale(&self, now_ms: i64) {
        if let Ok(mut windows) = self.windows.lock() {
            let horizon = now_ms - self.config.window_ms as i64;
            windows.retain(|_, window| {
                window.stamps.retain(|&stamp| stamp >= horizon);
                !window.stamps.is_empty() || window.locked_until_ms > now_ms
            });
        }
    }
}
