//! Retry executor.
//!
//! [`with_retry`] runs a fallible async operation, retrying classified
//! failures with jittered exponential backoff
//! ([`sync_core::calculate_backoff`]) until it succeeds, the classifier
//! rejects the error, or `max_retries` retries have been spent. The last
//! error is returned unchanged.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use sync_core::calculate_backoff;

/// Retry limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay (before jitter).
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(32000),
        }
    }
}

/// Run `operation`, retrying while `should_retry(&error, attempt)` allows.
///
/// `attempt` passed to the classifier counts from 0 for the first failure.
pub async fn with_retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    context: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E, u32) -> bool,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries || !should_retry(&err, attempt) {
                    tracing::error!("{} failed after {} attempts: {}", context, attempt + 1, err);
                    return Err(err);
                }

                let delay = calculate_backoff(attempt, policy.base_delay, policy.max_delay);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {}ms...",
                    context,
                    attempt + 1,
                    policy.max_retries + 1,
                    err,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn always(_: &String, _: u32) -> bool {
        true
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, String> = with_retry(&RetryPolicy::default(), "op", always, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let out: Result<u32, String> = with_retry(&RetryPolicy::default(), "op", always, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(format!("transient {}", n))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s and 2s backoff, each within ±10%.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2_700), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(3_300), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_with_last_error() {
        let calls = AtomicU32::new(0);
        let out: Result<(), String> = with_retry(&RetryPolicy::default(), "op", always, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err(format!("failure {}", n))
        })
        .await;

        // One attempt plus three retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(out, Err("failure 3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_stops_retries() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let out: Result<(), String> = with_retry(
            &RetryPolicy::default(),
            "op",
            |err: &String, _| !err.contains("permanent"),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("permanent: bad request".to_string())
            },
        )
        .await;

        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_means_single_attempt() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        let calls = AtomicU32::new(0);
        let out: Result<(), String> = with_retry(&policy, "op", always, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("x".to_string())
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
