use std::time::Duration;

use rand::Rng;

/// Fixed attempt ceiling with a randomized, doubling backoff window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            jitter_min: Duration::from_millis(1500),
            jitter_max: Duration::from_millis(4000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Backoff bounds after the failed attempt `attempt_index` (0-based).
    pub fn window_for_attempt(&self, attempt_index: u32) -> (Duration, Duration) {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let low = self.jitter_min.saturating_mul(factor).min(self.max_delay);
        let high = self
            .jitter_max
            .max(self.jitter_min)
            .saturating_mul(factor)
            .min(self.max_delay);
        (low, high.max(low))
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let (low, high) = self.window_for_attempt(attempt_index);
        jitter_between(low, high)
    }
}

/// Uniformly random duration in `[low, high]`, millisecond resolution.
pub fn jitter_between(low: Duration, high: Duration) -> Duration {
    if high <= low {
        return low;
    }
    let low_ms = low.as_millis() as u64;
    let high_ms = high.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(low_ms..=high_ms))
}
