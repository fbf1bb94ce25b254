//! Reconnect backoff.
//!
//! The Nth scheduled reconnect waits `min(max_delay, base_delay * N)`. With the
//! defaults that is 2s, 4s, 6s ... capped at 20s.

use std::time::Duration;

pub const BASE_DELAY: Duration = Duration::from_millis(2_000);
pub const MAX_DELAY: Duration = Duration::from_millis(20_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries until a terminal disconnect or success.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts.filter(|max| *max > 0);
        self
    }

    /// Delay for a 1-based attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt).min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}
