//! Backoff policy backing an [`crate::task::ExecutionTask`]'s retry loop.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff policy, with optional jitter to avoid a thundering
/// herd when many executions fail at once.
///
/// Constructed from a task's `retry_delay_ms`/`max_retries` fields so the
/// worker's failure path (the republish step) and any standalone delay
/// calculation agree on the same formula:
/// `delay = retry_delay_ms * backoff_coefficient ^ (retry_count - 1)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    pub backoff_coefficient: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy matching a task's own `retry_delay_ms`/`max_retries`, with no
    /// jitter and an unbounded interval cap — this is what the worker's
    /// failure path uses when republishing a task.
    pub fn from_task_defaults(retry_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries + 1,
            initial_interval: Duration::from_millis(retry_delay_ms),
            max_interval: Duration::from_millis(retry_delay_ms.saturating_mul(1 << 16)),
            backoff_coefficient: 2.0,
            jitter: 0.0,
        }
    }

    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Delay before retry `attempt` (1-based; `attempt == 1` is the initial
    /// try and has no delay, `attempt == 2` is the first retry, etc.)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base =
            self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_default_delays_match_the_documented_formula() {
        let policy = RetryPolicy::from_task_defaults(1000, 2);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
    }

    #[test]
    fn max_attempts_is_retries_plus_the_initial_try() {
        let policy = RetryPolicy::from_task_defaults(1000, 2);
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn max_interval_caps_the_backoff() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(0.0);
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn serializes_round_trip() {
        let policy = RetryPolicy::from_task_defaults(500, 4);
        let encoded = serde_json::to_string(&policy).unwrap();
        let decoded: RetryPolicy = serde_json::from_str(&encoded).unwrap();
        assert_eq!(policy, decoded);
    }
}
