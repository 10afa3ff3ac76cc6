//! Per-swap retry scheduling for transient chain failures

use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff with a delay cap. Never gives up: a swap with locked
/// funds must keep being driven until the chain reaches a terminal state.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
    next_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
            next_attempt: None,
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// Delay after `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Whether an attempt may be made now
    pub fn ready(&self) -> bool {
        self.next_attempt.map_or(true, |at| Instant::now() >= at)
    }

    /// Record a transient failure and return the delay before the next attempt
    pub fn fail(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.delay_for(self.failures);
        self.next_attempt = Some(Instant::now() + delay);
        delay
    }

    pub fn succeed(&mut self) {
        self.failures = 0;
        self.next_attempt = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
