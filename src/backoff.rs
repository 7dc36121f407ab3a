//! Capped exponential backoff for worker restarts and stream reconnects.
//!
//! Reconnects wait `base * 2^(n-1)` for the n-th consecutive failure, so the
//! first retry waits `base`. Restarts escalate one step earlier: after the n-th
//! crash the worker waits `base * 2^min(n, exponent_cap)`. Both are clamped to
//! `max`.

use std::time::Duration;

/// Delay for the n-th consecutive failure is `min(base * 2^(n-1), max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// Record one more failure and return the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay_for(self.failures)
    }

    /// Delay for the `n`-th consecutive failure (1-based). `n == 0` yields zero.
    pub fn delay_for(&self, n: u32) -> Duration {
        if n == 0 {
            return Duration::ZERO;
        }
        // 2^31 ms is already far past any sane cap.
        let exp = (n - 1).min(31);
        let factor = 1u32 << exp;
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Restart delay once `crashes` crashes have been counted.
    pub fn escalated(&self, crashes: u32, exponent_cap: u32) -> Duration {
        let exp = crashes.min(exponent_cap).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
