use crate::error::{Result, TwinError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::time::Duration;
use tracing::{debug, warn};

pub use twinsync_protocol::RecoverableError;

/// Bounded exponential backoff for idempotent operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// `initial_delay × backoff_factor^attempt`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.try_into().unwrap_or(i32::MAX);
        let factor = self.backoff_factor.powi(exponent);
        if !factor.is_finite() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Backoff for a classified failure; throttling waits longer than a
/// dropped connection.
#[must_use]
pub fn retry_delay(error: RecoverableError, attempt: u32, policy: &RetryPolicy) -> Duration {
    (policy.delay_for_attempt(attempt) * error.base_delay_multiplier()).min(policy.max_delay)
}

#[derive(Debug, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub last_error: Option<TwinError>,
    pub error_type: Option<RecoverableError>,
}

impl RetryState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self, error: TwinError) {
        self.attempts += 1;
        self.error_type = error.classify();
        self.last_error = Some(error);
    }

    #[must_use]
    pub fn should_retry(&self, policy: &RetryPolicy) -> bool {
        self.attempts <= policy.max_retries
    }

    #[must_use]
    pub fn next_delay(&self, policy: &RetryPolicy) -> Duration {
        let attempt = self.attempts.saturating_sub(1);
        match self.error_type {
            Some(error_type) => retry_delay(error_type, attempt, policy),
            None => policy.delay_for_attempt(attempt),
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_error = None;
        self.error_type = None;
    }
}

/// Runs `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or `policy.max_retries` retries are spent.
///
/// The last error is returned unchanged so callers can still tell
/// `AlreadyExists` apart from a transient failure.
pub async fn with_retry<T, F, Fut, P>(
    mut operation: F,
    is_retryable: P,
    policy: &RetryPolicy,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&TwinError) -> bool,
{
    let mut state = RetryState::new();

    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !is_retryable(&error) {
            return Err(error);
        }

        state.record_attempt(error);
        if !state.should_retry(policy) {
            warn!(attempts = state.attempts, "Retries exhausted");
            return Err(state.last_error.take().unwrap_or(TwinError::Timeout));
        }

        let delay = state.next_delay(policy);
        debug!(
            attempt = state.attempts,
            delay_ms = delay.as_millis(),
            error = ?state.last_error,
            "Retrying operation"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(max_retries)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = fast_policy(3);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_throttled_waits_longer() {
        let policy = fast_policy(3);
        assert_eq!(
            retry_delay(RecoverableError::NetworkError, 0, &policy),
            Duration::from_millis(100)
        );
        assert_eq!(
            retry_delay(RecoverableError::Throttled, 0, &policy),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_retry_state() {
        let policy = fast_policy(2);
        let mut state = RetryState::new();

        state.record_attempt(TwinError::ConnectionLost("reset".to_string()));
        assert!(state.should_retry(&policy));
        assert_eq!(state.error_type, Some(RecoverableError::NetworkError));
        assert_eq!(state.next_delay(&policy), Duration::from_millis(100));

        state.record_attempt(TwinError::ConnectionLost("reset".to_string()));
        assert!(state.should_retry(&policy));
        assert_eq!(state.next_delay(&policy), Duration::from_millis(200));

        state.record_attempt(TwinError::ConnectionLost("reset".to_string()));
        assert!(!state.should_retry(&policy));

        state.reset();
        assert_eq!(state.attempts, 0);
    }

    #[test]
    fn test_policy_from_json() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_retries":5,"initial_delay":"50ms"}"#).unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(50));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_from_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = with_retry(
            || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TwinError::ConnectionError("refused".to_string()))
                    } else {
                        Ok("open")
                    }
                }
            },
            TwinError::is_retryable,
            &fast_policy(3),
        )
        .await;

        assert_eq!(result, Ok("open"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_returns_last_error_when_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = with_retry(
            || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Err(TwinError::ConnectionError(format!("attempt {n}")))
                }
            },
            TwinError::is_retryable,
            &fast_policy(2),
        )
        .await;

        assert_eq!(
            result,
            Err(TwinError::ConnectionError("attempt 2".to_string()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_does_not_retry_permanent_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = with_retry(
            || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TwinError::AlreadyExists("dev".to_string()))
                }
            },
            TwinError::is_retryable,
            &fast_policy(5),
        )
        .await;

        assert_eq!(result, Err(TwinError::AlreadyExists("dev".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_backoff_is_monotonic_and_capped(
            initial_ms in 1u64..5_000,
            max_ms in 1u64..60_000,
            factor in 1.0f64..4.0,
            attempt in 0u32..64,
        ) {
            let policy = RetryPolicy::default()
                .with_initial_delay(Duration::from_millis(initial_ms))
                .with_max_delay(Duration::from_millis(max_ms))
                .with_backoff_factor(factor);

            let current = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            proptest::prop_assert!(current <= policy.max_delay);
            proptest::prop_assert!(next >= current);
        }
    }
}
