//! Exponential backoff for provider and channel calls.
//!
//! Only errors classified retryable by [`Retryable`] are retried. A
//! provider-supplied wait (rate-limit reset, `Retry-After`) replaces the
//! computed backoff for that attempt. An optional deadline bounds the total
//! time spent: each attempt is cut off when it arrives, and no backoff sleep
//! may cross it.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::errors::Retryable;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1` (attempt is 1-indexed).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// HTTP client whose every request is cut off after `timeout`.
pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to build HTTP client; requests rely on call deadlines only");
            reqwest::Client::new()
        })
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Non-retryable error, returned on first occurrence.
    Permanent(E),
    /// Attempt budget spent.
    Exhausted { attempts: u32, last: E },
    /// The deadline passed during an attempt, or the next wait would cross it.
    DeadlineExceeded { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent(e) | Self::Exhausted { last: e, .. } | Self::DeadlineExceeded { last: e, .. } => e,
        }
    }

    /// True when the failure came from running out of budget rather than a
    /// permanent error.
    pub fn is_budget_exhausted(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// Run `operation` until it succeeds, fails permanently, or the budget runs out.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    deadline: Option<Instant>,
    label: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display + From<tokio::time::error::Elapsed>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, operation()).await {
                Ok(outcome) => outcome,
                Err(elapsed) => {
                    tracing::warn!(label, attempt, "attempt cut off by deadline");
                    return Err(RetryError::DeadlineExceeded {
                        attempts: attempt,
                        last: E::from(elapsed),
                    });
                }
            },
            None => operation().await,
        };
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(RetryError::Permanent(err));
        }
        if attempt >= max_attempts {
            tracing::warn!(label, attempt, error = %err, "retry budget exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let wait = err
            .retry_after()
            .unwrap_or_else(|| policy.backoff_for(attempt));
        if let Some(deadline) = deadline
            && Instant::now() + wait > deadline
        {
            tracing::warn!(label, attempt, ?wait, error = %err, "retry wait would exceed deadline");
            return Err(RetryError::DeadlineExceeded {
                attempts: attempt,
                last: err,
            });
        }

        tracing::debug!(label, attempt, ?wait, error = %err, "retrying after backoff");
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FetchError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, RetryError<FetchError>> =
            retry_with_backoff(&fast_policy(4), None, "test", || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(FetchError::Network("reset".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), RetryError<FetchError>> =
            retry_with_backoff(&fast_policy(4), None, "test", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::Status {
                        status: 401,
                        message: "Bad credentials".into(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempt_budget() {
        let result: Result<(), RetryError<FetchError>> =
            retry_with_backoff(&fast_policy(3), None, "test", || async {
                Err(FetchError::Network("down".into()))
            })
            .await;
        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("Expected Exhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn rate_limit_wait_past_deadline_stops_early() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let result: Result<(), RetryError<FetchError>> =
            retry_with_backoff(&fast_policy(10), Some(deadline), "test", || async {
                Err(FetchError::RateLimited {
                    retry_after: Some(Duration::from_secs(60)),
                })
            })
            .await;
        let err = result.unwrap_err();
        assert!(err.is_budget_exhausted());
        assert!(matches!(err, RetryError::DeadlineExceeded { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_attempt_is_cut_off_at_the_deadline() {
        let start = Instant::now();
        let deadline = start + Duration::from_secs(2);
        let result: Result<(), RetryError<FetchError>> =
            retry_with_backoff(&fast_policy(3), Some(deadline), "test", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        match result {
            Err(RetryError::DeadlineExceeded { attempts, last }) => {
                assert_eq!(attempts, 1);
                assert!(matches!(last, FetchError::DeadlineElapsed));
            }
            other => panic!("Expected DeadlineExceeded, got {:?}", other.map(|_| ())),
        }
        assert!(Instant::now() - start < Duration::from_secs(3));
    }
}
