//! Retry bound and backoff for fallible generation calls.

use std::time::Duration;

use stagehand_types::ProducerError;

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// The single retry bound: at most `max_attempts` calls per scheduling round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// `attempt` is 1-based within the current round. Non-retryable errors
    /// give up immediately.
    pub fn decide(&self, attempt: u32, error: &ProducerError) -> RetryDecision {
        if error.is_retryable() && attempt < self.max_attempts {
            RetryDecision::RetryAfter(self.backoff.delay_for_attempt(attempt.saturating_sub(1)))
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Call `f` until it succeeds, returns a non-retryable error, or the policy's
/// bound is reached. The last error is returned unchanged.
pub async fn execute_with_retry<T, F, Fut>(
    f: F,
    policy: &RetryPolicy,
    label: &str,
) -> Result<T, ProducerError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProducerError>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => match policy.decide(attempt, &e) {
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        target_label = %label,
                        attempt,
                        delay_ms = %delay.as_millis(),
                        error = %e,
                        "Retryable error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_backoff(BackoffPolicy::None)
    }

    // 1. Success on first try
    #[tokio::test]
    async fn success_on_first_try() {
        let result = execute_with_retry(|| async { Ok::<_, ProducerError>("done") }, &quick(3), "plan")
            .await;
        assert_eq!(result.unwrap(), "done");
    }

    // 2. Retryable error succeeds on second try
    #[tokio::test]
    async fn retry_on_retryable_error_succeeds() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result = execute_with_retry(
            move || {
                let cc = cc.clone();
                async move {
                    if cc.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ProducerError::transient("rate limited"))
                    } else {
                        Ok("recovered")
                    }
                }
            },
            &quick(3),
            "plan",
        )
        .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    // 3. Bound reached returns the last error
    #[tokio::test]
    async fn bound_reached_returns_last_error() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result: Result<(), _> = execute_with_retry(
            move || {
                let cc = cc.clone();
                async move {
                    let n = cc.fetch_add(1, Ordering::SeqCst);
                    Err(ProducerError::transient(format!("timeout #{n}")))
                }
            },
            &quick(3),
            "architect",
        )
        .await;

        assert_eq!(result.unwrap_err().message, "timeout #2");
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    // 4. Non-retryable error is returned immediately
    #[tokio::test]
    async fn non_retryable_error_no_retry() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let result: Result<(), _> = execute_with_retry(
            move || {
                let cc = cc.clone();
                async move {
                    cc.fetch_add(1, Ordering::SeqCst);
                    Err(ProducerError::permanent("invalid credentials"))
                }
            },
            &quick(5),
            "plan",
        )
        .await;

        assert!(!result.unwrap_err().is_retryable());
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    // 5. Fixed backoff returns constant delay
    #[test]
    fn fixed_backoff_constant_delay() {
        let policy = BackoffPolicy::Fixed(Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(100), Duration::from_millis(200));
    }

    // 6. Exponential backoff doubles and caps
    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(500));
    }

    // 7. Defaults
    #[test]
    fn default_policy_allows_three_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.backoff.delay_for_attempt(20), Duration::from_secs(30));
    }

    // 8. Decision table
    #[test]
    fn decide_respects_bound_and_retryability() {
        let policy = quick(3);
        let transient = ProducerError::transient("x");
        assert_eq!(policy.decide(1, &transient), RetryDecision::RetryAfter(Duration::ZERO));
        assert_eq!(policy.decide(2, &transient), RetryDecision::RetryAfter(Duration::ZERO));
        assert_eq!(policy.decide(3, &transient), RetryDecision::GiveUp);
        assert_eq!(
            policy.decide(1, &ProducerError::permanent("x")),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn zero_bound_is_clamped_to_one_attempt() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }
}
