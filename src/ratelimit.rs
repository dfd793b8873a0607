//! Per-client fixed-window rate limiting for destructive proxied requests

use crate::clock::{Clock, SystemClock};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Length of one quota window
pub const WINDOW: Duration = Duration::from_secs(60);

struct Window {
    started: Instant,
    count: u32,
}

/// Allows `quota` requests per client per window
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    quota: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// `quota` requests per minute, on the system clock
    pub fn per_minute(quota: u32) -> Self {
        Self::with_clock(quota, WINDOW, Arc::new(SystemClock))
    }

    pub fn with_clock(quota: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            quota,
            window,
            clock,
        }
    }

    /// Count a request for `key`
    ///
    /// Returns the seconds until the window resets when the quota is exhausted.
    pub fn check(&self, key: &str) -> Result<(), u64> {
        let now = self.clock.now();
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= self.quota {
            let remaining = self
                .window
                .saturating_sub(now.saturating_duration_since(entry.started));
            // Round up so callers never retry inside the window
            let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            return Err(secs.max(1));
        }

        entry.count += 1;
        Ok(())
    }

    /// Drop windows that have fully elapsed
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < self.window);
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}
