use rand::Rng;
use std::time::Duration;

use crate::jobs::error_codes::ErrorClass;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub base: Duration,
    pub cap: Duration,
    pub jitter_pct: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(2),
            cap: Duration::from_secs(15 * 60),
            jitter_pct: 0.20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    /// Same backoff curve with a different ceiling. Jobs carry their own
    /// `max_retries` from submission time.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether another attempt is allowed after `attempt_count` attempts.
    /// The first execution is not a retry, so the ceiling is `max_retries + 1`.
    pub fn should_retry(&self, attempt_count: i32, class: ErrorClass) -> bool {
        class == ErrorClass::Transient && attempt_count <= self.max_retries
    }

    pub fn decide(&self, attempt_count: i32, class: ErrorClass, rng: &mut impl Rng) -> RetryDecision {
        if self.should_retry(attempt_count, class) {
            RetryDecision::Retry {
                delay: self.delay_with(attempt_count, rng),
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    /// `base * 2^attempt_count`, capped. No jitter.
    pub fn base_delay(&self, attempt_count: i32) -> Duration {
        let exp = attempt_count.max(0) as u32;

        // If exp is too large, treat multiplier as huge and let cap handle it.
        let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);

        let base_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
        let cap_ms = self.cap.as_millis().min(u64::MAX as u128) as u64;

        Duration::from_millis(base_ms.saturating_mul(pow2).min(cap_ms))
    }

    pub fn delay_with(&self, attempt_count: i32, rng: &mut impl Rng) -> Duration {
        let delay_ms = self.base_delay(attempt_count).as_millis() as f64;
        let cap_ms = self.cap.as_millis() as f64;

        // jitter in range [-jitter_pct, +jitter_pct]
        let jitter_range = delay_ms * self.jitter_pct.max(0.0);
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let jittered = (delay_ms + jitter).round().clamp(0.0, cap_ms);
        Duration::from_millis(jittered as u64)
    }
}
