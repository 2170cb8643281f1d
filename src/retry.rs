//! Retry policy shared by the mirror resolver and the package-index refresh.

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::{BuildError, Result};

/// Max attempts, exponential backoff, and which errors are worth repeating.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt, capped at 16x.
    pub backoff: Duration,
    retryable: fn(&BuildError) -> bool,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable: BuildError::is_retryable,
        }
    }

    /// A single attempt, no retry.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Replace the retryable-error predicate.
    pub fn retry_if(mut self, predicate: fn(&BuildError) -> bool) -> Self {
        self.retryable = predicate;
        self
    }

    pub fn is_retryable(&self, err: &BuildError) -> bool {
        (self.retryable)(err)
    }

    /// Delay to wait before attempt number `attempt` (1-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.backoff * (1u32 << (attempt - 2).min(4))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted. The last error is returned.
    pub fn run<T, F>(&self, label: &str, cancel: &CancelToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            cancel.check()?;
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && self.is_retryable(&err) => {
                    let delay = self.delay_before(attempt + 1);
                    warn!(
                        step = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    sleep_cancellable(delay, cancel)?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn sleep_cancellable(total: Duration, cancel: &CancelToken) -> Result<()> {
    let step = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < total {
        cancel.check()?;
        let chunk = step.min(total - slept);
        thread::sleep(chunk);
        slept += chunk;
    }
    cancel.check()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> BuildError {
        BuildError::ToolInvocation {
            tool: "apt-get".into(),
            code: 100,
            stderr: "connection timed out".into(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(10));
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(10));
        assert_eq!(policy.delay_before(3), Duration::from_millis(20));
        assert_eq!(policy.delay_before(4), Duration::from_millis(40));
        assert_eq!(policy.delay_before(9), Duration::from_millis(160));
    }

    #[test]
    fn retries_transient_errors_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let mut calls = 0;
        let value = policy
            .run("refresh", &CancelToken::new(), |attempt| {
                calls += 1;
                if attempt < 3 {
                    Err(transient())
                } else {
                    Ok(attempt)
                }
            })
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn stops_at_max_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let mut calls = 0;
        let err = policy
            .run::<(), _>("refresh", &CancelToken::new(), |_| {
                calls += 1;
                Err(transient())
            })
            .unwrap_err();
        assert_eq!(calls, 2);
        assert!(err.is_retryable());
    }

    #[test]
    fn does_not_retry_deterministic_errors() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let mut calls = 0;
        let err = policy
            .run::<(), _>("refresh", &CancelToken::new(), |_| {
                calls += 1;
                Err(BuildError::Postcondition("missing".into()))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, BuildError::Postcondition(_)));
    }

    #[test]
    fn custom_predicate_retries_everything() {
        let policy = RetryPolicy::new(3, Duration::ZERO).retry_if(|_| true);
        let mut calls = 0;
        let _ = policy.run::<(), _>("x", &CancelToken::new(), |_| {
            calls += 1;
            Err(BuildError::Postcondition("x".into()))
        });
        assert_eq!(calls, 3);
    }
}
