//! Bounded retry with exponential backoff for external calls

use crate::error::{IngestError, IngestResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Generates a deserializer that refuses values outside `[min, max]`
macro_rules! bounded_field {
    ($name:ident, $ty:ty, $field:literal, $min:expr, $max:expr) => {
        fn $name<'de, D>(deserializer: D) -> Result<$ty, D::Error>
        where
            D: Deserializer<'de>,
        {
            let value = <$ty>::deserialize(deserializer)?;
            // NaN is not contained in any range
            if !($min..=$max).contains(&value) {
                return Err(serde::de::Error::custom(format!(
                    "{} must be within [{}, {}], got {}",
                    $field, $min, $max, value
                )));
            }
            Ok(value)
        }
    };
}

bounded_field!(retries_in_range, u32, "max_retries", 0, 1000);
bounded_field!(backoff_in_range, u64, "backoff_ms", 0, 3_600_000);
bounded_field!(multiplier_in_range, f64, "backoff_multiplier", 1.0, 100.0);
bounded_field!(jitter_in_range, f64, "jitter_factor", 0.0, 1.0);

/// Retry policy with validated bounds
///
/// `max_retries` counts retries after the first attempt, so an operation
/// runs at most `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    #[serde(deserialize_with = "retries_in_range")]
    pub max_retries: u32,
    /// Initial backoff in milliseconds
    #[serde(deserialize_with = "backoff_in_range")]
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    #[serde(deserialize_with = "backoff_in_range")]
    pub max_backoff_ms: u64,
    /// Growth factor applied per retry; 1.0 keeps the delay flat
    #[serde(deserialize_with = "multiplier_in_range")]
    pub backoff_multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the base
    #[serde(deserialize_with = "jitter_in_range")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Initial backoff
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Backoff ceiling
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Calculate the backoff before retry number `attempt` (1-based)
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let initial = self.initial_backoff().as_secs_f64();
        let ceiling = self.max_backoff().as_secs_f64();

        // powf overflows long before attempt 64
        let exponent = attempt.saturating_sub(1).min(63) as f64;
        let multiplier = self.backoff_multiplier.powf(exponent);
        let base = if multiplier.is_finite() {
            (initial * multiplier).min(ceiling)
        } else {
            ceiling
        };

        let jitter = base * self.jitter_factor * rand::random::<f64>();
        let backoff = Duration::from_secs_f64(base + jitter);

        debug!(attempt, ?backoff, "calculated retry backoff");
        backoff
    }

    /// Check if another retry is allowed after `retries` retries
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Single attempt, never retried
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Constant delay between attempts, no jitter
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        let ms = backoff.as_millis() as u64;
        Self {
            max_retries,
            initial_backoff_ms: ms,
            max_backoff_ms: ms,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Doubling delay capped at `max`, with 10% jitter
    pub fn exponential(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: initial.as_millis() as u64,
            max_backoff_ms: max.as_millis() as u64,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Outcome of a retried operation
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Success, possibly after retries
    Success {
        /// Returned value
        value: T,
        /// Retries performed
        retries: u32,
    },
    /// Failed after exhausting retries or hitting a permanent error
    Failed {
        /// Last error
        error: E,
        /// Retries performed
        retries: u32,
    },
}

/// Drives an operation through a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Wrap a policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds or the error is not worth retrying
    pub async fn execute_with_predicate<F, Fut, P, T, E>(
        &self,
        mut operation: F,
        mut should_retry: P,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut retries = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!(retries, "operation succeeded after retries");
                    }
                    return RetryResult::Success { value, retries };
                }
                Err(error) => {
                    if !self.policy.should_retry(retries) || !should_retry(&error) {
                        return RetryResult::Failed { error, retries };
                    }

                    retries += 1;
                    let backoff = self.policy.next_backoff(retries);
                    warn!(attempt = retries, ?backoff, %error, "operation failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Run a pipeline operation, retrying retryable errors under a per-attempt timeout
    ///
    /// Returns the value together with the number of retries it took.
    /// Non-retryable errors are returned unchanged; exhausting the policy
    /// yields [`IngestError::RetriesExhausted`].
    pub async fn run<F, Fut, T>(
        &self,
        operation_name: &str,
        timeout: Duration,
        mut operation: F,
    ) -> IngestResult<(T, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = IngestResult<T>>,
    {
        let result = self
            .execute_with_predicate(
                || {
                    let attempt = operation();
                    async move {
                        match tokio::time::timeout(timeout, attempt).await {
                            Ok(result) => result,
                            Err(_) => Err(IngestError::Timeout(format!(
                                "{} exceeded {:?}",
                                operation_name, timeout
                            ))),
                        }
                    }
                },
                IngestError::is_retryable,
            )
            .await;

        match result {
            RetryResult::Success { value, retries } => Ok((value, retries)),
            RetryResult::Failed { error, retries } if error.is_retryable() => {
                Err(IngestError::RetriesExhausted {
                    operation: operation_name.to_string(),
                    attempts: retries + 1,
                    last_error: error.to_string(),
                })
            }
            RetryResult::Failed { error, .. } => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_schedule() {
        let exp = RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(1))
        };
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(250));

        let cases = [
            (&exp, 0, 0),
            (&exp, 1, 100),
            (&exp, 2, 200),
            (&exp, 4, 800),
            (&exp, 5, 1000),
            (&exp, 60, 1000),
            (&fixed, 0, 0),
            (&fixed, 1, 250),
            (&fixed, 3, 250),
        ];
        for (policy, attempt, expected_ms) in cases {
            assert_eq!(
                policy.next_backoff(attempt).as_millis(),
                expected_ms,
                "attempt {}",
                attempt
            );
        }
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let policy =
            RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));
        for _ in 0..50 {
            let backoff = policy.next_backoff(2);
            assert!(backoff >= Duration::from_millis(200));
            assert!(backoff <= Duration::from_millis(220));
        }
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(1));
        let allowed: Vec<bool> = (0..4).map(|r| policy.should_retry(r)).collect();
        assert_eq!(allowed, vec![true, true, false, false]);
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[tokio::test]
    async fn test_run_recovers_from_transient_errors() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(3, Duration::from_millis(5)));
        let calls = Arc::new(AtomicU32::new(0));

        let result = executor
            .run("sink write", Duration::from_secs(1), || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(IngestError::Sink("connection reset".into()))
                    } else {
                        Ok("written")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, ("written", 2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_exhausts_retries() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(2, Duration::from_millis(1)));

        let err = executor
            .run("checkpoint", Duration::from_secs(1), || async {
                Err::<(), _>(IngestError::Checkpoint("unavailable".into()))
            })
            .await
            .unwrap_err();

        match err {
            IngestError::RetriesExhausted {
                operation,
                attempts,
                ..
            } => {
                assert_eq!(operation, "checkpoint");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent_errors() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(5, Duration::from_millis(1)));
        let calls = Arc::new(AtomicU32::new(0));

        let err = executor
            .run("sink write", Duration::from_secs(1), || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(IngestError::PoisonRecord {
                        offset: 4,
                        id: "e-4".into(),
                        reason: "empty source".into(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::PoisonRecord { offset: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_times_out_slow_attempts() {
        let executor = RetryExecutor::new(RetryPolicy::no_retry());

        let err = executor
            .run("log append", Duration::from_millis(10), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::RetriesExhausted { attempts: 1, .. }));
    }

    #[test]
    fn test_policy_bounds_enforced_on_load() {
        let partial: RetryPolicy = serde_yaml::from_str("max_retries: 1").unwrap();
        assert_eq!(partial.max_retries, 1);
        assert_eq!(partial.initial_backoff_ms, 100);

        for bad in [
            "max_retries: 5000",
            "initial_backoff_ms: 7200000",
            "backoff_multiplier: 0.5",
            "backoff_multiplier: .nan",
            "jitter_factor: 1.5",
        ] {
            assert!(serde_yaml::from_str::<RetryPolicy>(bad).is_err(), "{}", bad);
        }
    }
}
