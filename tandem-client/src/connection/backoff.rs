//! Reconnect delay schedule
//!
//! `min(base * 2^attempt, cap)` plus up to `jitter_ratio` of random extra
//! delay. Delays never decrease within one outage, so jitter at the cap
//! can't make a later attempt come sooner than an earlier one.

use rand::Rng;
use std::time::Duration;

use crate::config::ConnectionSettings;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter_ratio: f64,
    max_attempts: u32,
    attempt: u32,
    last_delay: Duration,
}

impl Backoff {
    pub fn new(settings: &ConnectionSettings) -> Self {
        Self {
            base: settings.backoff_base(),
            cap: settings.backoff_cap(),
            jitter_ratio: settings.jitter_ratio.max(0.0),
            max_attempts: settings.max_attempts,
            attempt: 0,
            last_delay: Duration::ZERO,
        }
    }

    /// Failed attempts since the last successful connection
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Delay before the next attempt, or None once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.next_delay_at_least(Duration::ZERO)
    }

    /// Like `next_delay`, but never shorter than `floor` (breaker cool-down)
    pub fn next_delay_at_least(&mut self, floor: Duration) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let computed = self.base.saturating_mul(factor).min(self.cap);
        let jitter = if self.jitter_ratio > 0.0 {
            computed.mul_f64(self.jitter_ratio * rand::thread_rng().gen_range(0.0..=1.0))
        } else {
            Duration::ZERO
        };
        let delay = (computed + jitter).max(self.last_delay).max(floor);

        self.attempt += 1;
        self.last_delay = delay;
        Some(delay)
    }

    /// Back to attempt 0 (on reaching connected)
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = Duration::ZERO;
    }
}
