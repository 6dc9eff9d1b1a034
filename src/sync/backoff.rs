//! Retry policy shared by the foreground queue and the background worker.

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// A record is evicted once its failed attempts reach this number.
    pub max_attempts: u32,
    /// Upper bound (exclusive) of the random jitter added to each delay.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 300_000,
            max_attempts: 5,
            jitter_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// `min(max_delay, base_delay * 2^(attempts - 1))`, no jitter.
    pub fn capped_delay_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(32);
        self.base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms)
    }

    /// Delay before the next attempt after `attempts` consecutive failures.
    pub fn backoff_delay_ms(&self, attempts: u32) -> u64 {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        } else {
            0
        };
        self.capped_delay_ms(attempts).saturating_add(jitter)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.capped_delay_ms(1), 2_000);
        assert_eq!(policy.capped_delay_ms(2), 4_000);
        assert_eq!(policy.capped_delay_ms(3), 8_000);
        assert_eq!(policy.capped_delay_ms(4), 16_000);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.capped_delay_ms(9), 300_000);
        assert_eq!(policy.capped_delay_ms(20), 300_000);
        assert_eq!(policy.capped_delay_ms(u32::MAX), 300_000);
    }

    #[test]
    fn test_zero_attempts_uses_base() {
        assert_eq!(RetryPolicy::default().capped_delay_ms(0), 2_000);
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=12).map(|n| policy.capped_delay_ms(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let delay = policy.backoff_delay_ms(2);
            assert!((4_000..5_000).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_no_jitter_when_disabled() {
        let policy = RetryPolicy {
            jitter_ms: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_delay_ms(3), 8_000);
    }

    #[test]
    fn test_exhaustion_threshold() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }
}
