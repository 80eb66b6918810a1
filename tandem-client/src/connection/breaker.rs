//! Circuit breaker for connection attempts
//!
//! Counts consecutive connect failures independently of the backoff
//! schedule. At the threshold it opens and short-circuits attempts until the
//! cool-down elapses, then half-opens to let one probe through.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    failures: u32,
    opened_at: Option<Instant>,
    half_open: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            failures: 0,
            opened_at: None,
            half_open: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.opened_at {
            None => BreakerState::Closed,
            Some(_) if self.half_open => BreakerState::HalfOpen,
            Some(opened_at) if opened_at.elapsed() >= self.cooldown => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
        }
    }

    /// Consecutive failures counted so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Ok if an attempt may proceed, Err with the remaining cool-down otherwise
    pub fn check(&mut self) -> Result<(), Duration> {
        match self.state() {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                if !self.half_open {
                    info!("Circuit breaker half-open, probing connection");
                    self.half_open = true;
                }
                Ok(())
            }
            BreakerState::Open => {
                let elapsed = self.opened_at.map_or(Duration::ZERO, |t| t.elapsed());
                Err(self.cooldown.saturating_sub(elapsed))
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.opened_at.is_some() {
            info!("Circuit breaker closed");
        }
        self.failures = 0;
        self.opened_at = None;
        self.half_open = false;
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        if self.half_open {
            warn!("Circuit breaker probe failed, reopening");
            self.opened_at = Some(Instant::now());
            self.half_open = false;
        } else if self.opened_at.is_none() && self.failures >= self.threshold {
            warn!(
                "Circuit breaker open after {} consecutive failure(s)",
                self.failures
            );
            self.opened_at = Some(Instant::now());
        }
    }
}
