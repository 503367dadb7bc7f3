//! Exponential backoff between recovery attempts.

use std::time::Duration;

/// Cap on the number of times the base delay is doubled.
pub const MAX_DOUBLINGS: u32 = 10;

/// Schedules recovery attempts at `created_at + base * 2^min(attempts, MAX_DOUBLINGS)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay after creation before attempt number `attempts + 1`.
    pub fn delay(&self, attempts: u32) -> Duration {
        self.base
            .saturating_mul(1u32 << attempts.min(MAX_DOUBLINGS))
    }

    /// Unix millis at which the next attempt becomes eligible.
    pub fn next_attempt_at(&self, created_at: u64, attempts: u32) -> u64 {
        let delay = u64::try_from(self.delay(attempts).as_millis()).unwrap_or(u64::MAX);
        created_at.saturating_add(delay)
    }

    pub fn is_eligible(&self, created_at: u64, attempts: u32, now: u64) -> bool {
        now >= self.next_attempt_at(created_at, attempts)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
