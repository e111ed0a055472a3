//! Bounded retries with exponential backoff.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::{AgentError, ProcessError};

/// Retry schedule: `delay(n) = min(initial * multiplier^(n-1), max)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ProcessError {
    fn is_retryable(&self) -> bool {
        ProcessError::is_retryable(self)
    }
}

impl Retryable for AgentError {
    fn is_retryable(&self) -> bool {
        match self {
            AgentError::Process(e) => e.is_retryable(),
            AgentError::Halted(_) | AgentError::Payload(_) | AgentError::RetriesExhausted { .. } => {
                false
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },

    #[error("{0}")]
    Fatal(E),

    #[error("Cancelled after {attempts} attempts: {last}")]
    Cancelled { attempts: u32, last: E },
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `config.max_attempts` is reached. The operation receives the 1-based
/// attempt number.
pub async fn run_with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::error::Error + 'static,
{
    run_with_retry_until(config, &CancellationToken::new(), operation).await
}

/// Like [`run_with_retry`], but gives up as soon as `cancel` fires, including
/// in the middle of a backoff sleep.
pub async fn run_with_retry_until<T, E, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::error::Error + 'static,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() {
            return Err(RetryError::Fatal(err));
        }
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                last: err,
            });
        }
        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = config.delay(attempt);
        warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt, last: err });
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, Error)]
    #[error("test failure (retryable: {retryable})")]
    struct TestError {
        retryable: bool,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    #[test]
    fn delay_schedule_doubles_and_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            ..RetryConfig::default()
        };
        let secs: Vec<u64> = (1..=8).map(|n| config.delay(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn delay_survives_huge_attempt_numbers() {
        let config = RetryConfig::default();
        assert_eq!(config.delay(u32::MAX), Duration::from_secs(30));
        assert_eq!(config.delay(0), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_with_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let counter = Arc::clone(&calls);
        let result = run_with_retry(&RetryConfig::default(), move |attempt| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(TestError { retryable: true })
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = run_with_retry(&RetryConfig::default(), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TestError { retryable: false })
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempt_count() {
        let result: Result<(), _> = run_with_retry(&RetryConfig::default(), |_| async {
            Err(TestError { retryable: true })
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.retryable);
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_secs(60),
            ..RetryConfig::default()
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result: Result<(), _> = run_with_retry_until(&config, &cancel, |_| async {
            Err(TestError { retryable: true })
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Cancelled { attempts: 1, .. })
        ));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn agent_errors_classify_through_process_errors() {
        assert!(AgentError::Process(ProcessError::Interrupted).is_retryable());
        assert!(!AgentError::Halted(ProcessError::Interrupted).is_retryable());
        assert!(!AgentError::Payload("bad image".into()).is_retryable());
    }
}
