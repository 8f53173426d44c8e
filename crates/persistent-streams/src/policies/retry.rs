//! Retry executor with a retry filter, an attempt budget and an elapsed-time budget.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::backoff::ExponentialBackoff;

/// Attempt and time budget of [`execute_with_retries`].
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    /// Retries after the first attempt, `None` for unbounded.
    pub max_retries: Option<u32>,
    /// Give up once this much time has passed since the first attempt.
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            max_elapsed: None,
        }
    }

    pub fn max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }
}

/// Runs `operation` until it succeeds, the filter rejects an error, the
/// budget is spent, or `token` is cancelled. The last error is returned.
///
/// `operation` receives the 0-indexed attempt number; `retry_filter` sees each
/// error with its attempt number and returns whether to try again.
pub async fn execute_with_retries<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    backoff: &ExponentialBackoff,
    token: &CancellationToken,
    mut retry_filter: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E, u32) -> bool,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if token.is_cancelled() || !retry_filter(&err, attempt) {
            return Err(err);
        }
        if policy.max_retries.is_some_and(|max| attempt >= max) {
            return Err(err);
        }

        let delay = backoff.next_delay(attempt);
        if let Some(max_elapsed) = policy.max_elapsed {
            if started.elapsed() + delay > max_elapsed {
                debug!(attempt, "Retry budget exhausted");
                return Err(err);
            }
        }

        tokio::select! {
            _ = token.cancelled() => return Err(err),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<u32, &str> = execute_with_retries(
            &RetryPolicy::with_max_retries(5),
            &fast_backoff(),
            &CancellationToken::new(),
            |_, _| true,
            |attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { if attempt < 2 { Err("boom") } else { Ok(attempt) } }
            },
        )
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_max_retries_bounds_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), &str> = execute_with_retries(
            &RetryPolicy::with_max_retries(6),
            &fast_backoff(),
            &CancellationToken::new(),
            |_, _| true,
            |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err("down") }
            },
        )
        .await;

        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_filter_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), &str> = execute_with_retries(
            &RetryPolicy::unbounded(),
            &fast_backoff(),
            &CancellationToken::new(),
            |err, _| *err != "fatal",
            |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal") }
            },
        )
        .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_ends_unbounded_retries() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let result: Result<(), &str> = execute_with_retries(
            &RetryPolicy::unbounded(),
            &fast_backoff(),
            &token,
            |_, attempt| {
                if attempt == 3 {
                    cancel.cancel();
                }
                true
            },
            |_| async { Err("retry") },
        )
        .await;

        assert_eq!(result, Err("retry"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_budget() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(400),
            Duration::from_millis(400),
            Duration::ZERO,
        );
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), &str> = execute_with_retries(
            &RetryPolicy::unbounded().max_elapsed(Duration::from_secs(1)),
            &backoff,
            &CancellationToken::new(),
            |_, _| true,
            |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err("slow") }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
