//! Bounded same-state retry.
//!
//! A transient failure re-enters the entity's current state, which bumps
//! `state_count`. Once `state_count` reaches `max_retries` the next failure
//! moves the entity to the machine's error state instead, so an entity is
//! attempted at most `max_retries + 1` times.

use leasehold_core::{Clock, Entity, Payload};
use std::sync::Arc;

/// Default retry bound.
pub const DEFAULT_MAX_RETRIES: u32 = 7;

/// Cap on the retry delay exponent.
const MAX_DELAY_SHIFT: u32 = 16;

/// What [`RetryPolicy::on_transient`] did to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Re-entered the same state; `attempt` retries so far.
    Retry { attempt: u32 },
    /// Moved to the error state.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay_ms: i64,
    clock: Arc<dyn Clock>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_retries,
            base_delay_ms: 0,
            clock,
        }
    }

    /// Delays the n-th retry by `base * 2^(n-1)` after the last attempt.
    pub fn with_base_delay(mut self, millis: i64) -> Self {
        self.base_delay_ms = millis.max(0);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Records a transient failure on `entity` without persisting it.
    pub fn on_transient<P: Payload>(
        &self,
        entity: &mut Entity<P>,
        error_state: P::State,
        detail: &str,
    ) -> RetryOutcome {
        let now = self.clock.now_millis();
        if entity.state_count < self.max_retries {
            let state = entity.state;
            entity.transition_with_error(state, detail, now);
            RetryOutcome::Retry {
                attempt: entity.state_count,
            }
        } else {
            entity.transition_with_error(
                error_state,
                format!(
                    "retry limit exceeded after {} attempts: {}",
                    self.max_retries + 1,
                    detail
                ),
                now,
            );
            RetryOutcome::Exhausted
        }
    }

    /// Milliseconds to wait before the `attempt`-th retry.
    pub fn delay_for(&self, attempt: u32) -> i64 {
        if attempt == 0 || self.base_delay_ms == 0 {
            return 0;
        }
        let shift = (attempt - 1).min(MAX_DELAY_SHIFT);
        self.base_delay_ms.saturating_mul(1_i64 << shift)
    }

    /// Returns false while a retrying entity is still inside its delay.
    pub fn is_due<P: Payload>(&self, entity: &Entity<P>) -> bool {
        let delay = self.delay_for(entity.state_count);
        delay == 0 || self.clock.now_millis() >= entity.state_timestamp.saturating_add(delay)
    }
}
