//! Rate limiting for remote API calls.
//!
//! A single [`RateLimiter`] guards all traffic to the remote CRM. Callers are
//! admitted strictly in arrival order: each `execute()` waits in a FIFO queue
//! until a token is granted, then runs its operation. One pump task per
//! limiter drains the queue, sleeping until the next refill when the bucket
//! is empty.
//!
//! ## Design Notes
//!
//! The bucket arithmetic lives in `sync-core` ([`TokenBucket`]). Time is
//! taken from the tokio clock so tests can run with a paused clock.
//!
//! Operations do not hold the limiter while they run: once a token is
//! granted the next waiter can be admitted immediately.
//!
//! A caller that gives up after its token was granted but before its
//! operation started passes the token to the next waiter, or back to the
//! bucket if nobody is waiting.

use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use sync_core::TokenBucket;
use tokio::sync::oneshot;

/// Limiter status, for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    /// Tokens available right now.
    pub available_tokens: u32,
    /// Bucket capacity.
    pub max_tokens: u32,
    /// Callers waiting for a token.
    pub queue_length: usize,
    /// Time until the next refill if the bucket is empty, in milliseconds.
    pub wait_time_ms: u64,
}

/// FIFO token-bucket limiter.
///
/// Cheap to clone; clones share the bucket and queue.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<LimiterState>>,
}

#[derive(Debug)]
struct LimiterState {
    bucket: TokenBucket,
    waiters: VecDeque<oneshot::Sender<()>>,
    pumping: bool,
}

fn clock_now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

fn lock_state(inner: &Mutex<LimiterState>) -> MutexGuard<'_, LimiterState> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Give a token already taken from the bucket to the oldest waiter still
/// listening, or back to the bucket.
fn hand_over(state: &mut LimiterState, now: std::time::Instant) {
    while let Some(waiter) = state.waiters.pop_front() {
        if waiter.send(()).is_ok() {
            return;
        }
    }
    state.bucket.restore(now);
}

/// A caller's place in the waiter queue.
struct Ticket {
    rx: oneshot::Receiver<()>,
    inner: Arc<Mutex<LimiterState>>,
    used: bool,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.used {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            tracing::trace!("Rate limiter: granted token returned by a cancelled caller");
            hand_over(&mut lock_state(&self.inner), clock_now());
        }
    }
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    pub fn new(max_tokens: u32, refill_window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LimiterState {
                bucket: TokenBucket::new(max_tokens, refill_window, clock_now()),
                waiters: VecDeque::new(),
                pumping: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        lock_state(&self.inner)
    }

    /// Wait for a token, then run `operation`.
    ///
    /// The operation's own result (or error) is returned unchanged; it
    /// consumes exactly one token however long it takes.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire().await;
        operation().await
    }

    async fn acquire(&self) {
        let mut ticket = {
            let mut state = self.lock();

            // Only skip the queue when nobody is waiting, to keep FIFO order.
            if state.waiters.is_empty() && state.bucket.try_acquire(clock_now()) {
                tracing::trace!(
                    "Rate limiter: admitted immediately, {} tokens left",
                    state.bucket.available(clock_now())
                );
                return;
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            if !state.pumping {
                state.pumping = true;
                tokio::spawn(pump(Arc::clone(&self.inner)));
            }
            Ticket {
                rx,
                inner: Arc::clone(&self.inner),
                used: false,
            }
        };

        // The pump never drops a sender without sending.
        let _ = (&mut ticket.rx).await;
        ticket.used = true;
    }

    /// Current status.
    pub fn status(&self) -> RateLimitStatus {
        let mut state = self.lock();
        let now = clock_now();
        let status = state.bucket.status(now);
        RateLimitStatus {
            available_tokens: status.available_tokens,
            max_tokens: status.max_tokens,
            queue_length: state.waiters.len(),
            wait_time_ms: status.wait_time.as_millis() as u64,
        }
    }
}

/// Drain the waiter queue, one token per waiter.
async fn pump(inner: Arc<Mutex<LimiterState>>) {
    loop {
        let wait = {
            let mut state = lock_state(&inner);

            // Callers that gave up do not get a token.
            while state.waiters.front().is_some_and(|w| w.is_closed()) {
                state.waiters.pop_front();
            }
            if state.waiters.is_empty() {
                state.pumping = false;
                return;
            }

            let now = clock_now();
            if state.bucket.try_acquire(now) {
                hand_over(&mut state, now);
                None
            } else {
                Some((state.bucket.wait_time(now), state.waiters.len()))
            }
        };

        if let Some((wait, queued)) = wait {
            tracing::debug!(
                "Rate limiter: waiting {}ms for token refill. Queue size: {}",
                wait.as_millis(),
                queued
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    const WINDOW: Duration = Duration::from_millis(10_000);

    #[tokio::test(start_paused = true)]
    async fn n_operations_run_without_delay() {
        let limiter = RateLimiter::new(3, WINDOW);
        let start = Instant::now();

        for i in 0..3 {
            let out = limiter.execute(|| async move { i * 2 }).await;
            assert_eq!(out, i * 2);
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.status().available_tokens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn next_operation_waits_for_refill() {
        let limiter = RateLimiter::new(2, WINDOW);
        let start = Instant::now();

        limiter.execute(|| async {}).await;
        limiter.execute(|| async {}).await;
        limiter.execute(|| async {}).await;

        assert!(start.elapsed() >= WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_admitted_in_order() {
        let limiter = RateLimiter::new(1, WINDOW);
        limiter.execute(|| async {}).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter
                    .execute(|| async move {
                        order.lock().unwrap().push(i);
                    })
                    .await;
            }));
            // Make sure each task is queued before the next one starts.
            tokio::task::yield_now().await;
        }

        assert_eq!(limiter.status().queue_length, 4);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_propagate_and_cost_one_token() {
        let limiter = RateLimiter::new(5, WINDOW);
        let calls = AtomicUsize::new(0);

        let result: Result<(), &str> = limiter
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom")
            })
            .await;

        assert_eq!(result, Err("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.status().available_tokens, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn status_never_exceeds_max() {
        let limiter = RateLimiter::new(2, WINDOW);
        for _ in 0..5 {
            limiter.execute(|| async {}).await;
            let status = limiter.status();
            assert!(status.available_tokens <= status.max_tokens);
            tokio::time::advance(WINDOW * 3).await;
        }
        let status = limiter.status();
        assert_eq!(status.available_tokens, 2);
        assert_eq!(status.wait_time_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_caller_returns_granted_token() {
        let limiter = RateLimiter::new(1, WINDOW);
        limiter.execute(|| async {}).await;

        let ran = AtomicUsize::new(0);
        let mut cancelled = Box::pin(limiter.execute(|| async {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
        tokio::select! {
            biased;
            _ = &mut cancelled => panic!("admitted without a token"),
            _ = tokio::task::yield_now() => {}
        }
        assert_eq!(limiter.status().queue_length, 1);

        // The refill is granted to the queued caller, which then goes away.
        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
        assert_eq!(limiter.status().queue_length, 0);
        drop(cancelled);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.status().available_tokens, 1);

        let start = Instant::now();
        limiter.execute(|| async {}).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_caller_passes_token_to_next_waiter() {
        let limiter = RateLimiter::new(1, WINDOW);
        let start = Instant::now();
        limiter.execute(|| async {}).await;

        let mut cancelled = Box::pin(limiter.execute(|| async {}));
        tokio::select! {
            biased;
            _ = &mut cancelled => panic!("admitted without a token"),
            _ = tokio::task::yield_now() => {}
        }
        let next = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.execute(|| async { Instant::now() }).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(limiter.status().queue_length, 2);

        tokio::time::sleep(WINDOW + Duration::from_millis(1)).await;
        drop(cancelled);

        let admitted_at = next.await.unwrap();
        assert!(admitted_at - start < WINDOW * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_wait_when_empty() {
        let limiter = RateLimiter::new(1, WINDOW);
        limiter.execute(|| async {}).await;
        tokio::time::advance(Duration::from_millis(4_000)).await;

        let status = limiter.status();
        assert_eq!(status.available_tokens, 0);
        assert_eq!(status.wait_time_ms, 6_000);
    }
}
