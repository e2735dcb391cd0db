//! Idle backoff between manager ticks.

use std::time::Duration;

/// Decides how long a manager sleeps after a tick.
pub trait WaitStrategy: Send {
    /// Reports how many entities the last tick processed.
    fn success(&mut self, processed: usize);

    /// Current sleep before the next tick.
    fn wait_time(&self) -> Duration;
}

/// Doubles the wait after every idle tick, up to `max`; any work resets it
/// to `min`.
#[derive(Debug, Clone)]
pub struct ExponentialWaitStrategy {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialWaitStrategy {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn from_millis(min_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(min_ms), Duration::from_millis(max_ms))
    }
}

impl WaitStrategy for ExponentialWaitStrategy {
    fn success(&mut self, processed: usize) {
        if processed > 0 {
            self.current = self.min;
        } else {
            self.current = self.current.saturating_mul(2).min(self.max);
        }
    }

    fn wait_time(&self) -> Duration {
        self.current
    }
}

/// Always waits the same amount.
#[derive(Debug, Clone, Copy)]
pub struct FixedWaitStrategy(pub Duration);

impl FixedWaitStrategy {
    pub fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }
}

impl WaitStrategy for FixedWaitStrategy {
    fn success(&mut self, _processed: usize) {}

    fn wait_time(&self) -> Duration {
        self.0
    }
}
