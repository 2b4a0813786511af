//! Bounded exponential backoff

use std::time::Duration;

use crate::config::ReconnectPolicy;

/// Delay sequence `initial, initial*m, initial*m², ...` capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    next: Duration,
}

impl Backoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        let initial = policy.initial_backoff();
        Self {
            initial,
            max: policy.max_backoff(),
            multiplier: policy.multiplier.max(1),
            next: initial,
        }
    }

    /// Delay to wait after the current failure; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = delay.saturating_mul(self.multiplier).min(self.max);
        delay
    }

    /// Start over after a success (or a forced reconnect)
    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}
