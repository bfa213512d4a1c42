//! Doubling delay schedule.
//!
//! Used twice with different policies:
//!
//! - the socket's reconnect loop is **unbounded**: it keeps retrying at the
//!   capped delay forever and resets to the base after a successful connect;
//! - a channel's rejoin loop is **bounded**: after `max_attempts` it gives up
//!   and the channel stays errored.

use std::time::Duration;

/// Exponential backoff: `base, 2*base, 4*base, ...` capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl Backoff {
    /// Schedule that never runs out of attempts.
    pub fn unbounded(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            max_attempts: None,
            attempts: 0,
        }
    }

    /// Schedule that yields at most `max_attempts` delays.
    pub fn bounded(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::unbounded(base, max)
        }
    }

    /// Delay for the given 1-based attempt: `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1_u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Delay the next attempt would wait, without consuming it.
    pub fn current(&self) -> Duration {
        self.delay_for(self.attempts + 1)
    }

    /// Consume one attempt and return its delay.
    ///
    /// Returns `None` once a bounded schedule is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some(self.delay_for(self.attempts))
    }

    /// Back to the base delay with a fresh attempt budget.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts consumed since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns `true` if a bounded schedule has no attempts left.
    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempts >= max)
    }
}
