//! Token bucket arithmetic.
//!
//! The bucket holds up to `max_tokens`. Whenever at least one refill window
//! has elapsed since `last_refill`, it is topped up by
//! `floor(elapsed / window) * max_tokens` (capped at `max_tokens`) and
//! `last_refill` advances by exactly the consumed whole windows, so the
//! sub-window remainder carries over and refills do not drift.
//!
//! Time is passed in explicitly; the async limiter in `sync-client` supplies
//! it from the runtime clock.

use std::time::{Duration, Instant};

/// Snapshot of bucket state for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStatus {
    /// Tokens available right now.
    pub available_tokens: u32,
    /// Bucket capacity.
    pub max_tokens: u32,
    /// Time until the next refill if the bucket is empty, else zero.
    pub wait_time: Duration,
}

/// Token bucket with whole-window refills.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    max_tokens: u32,
    window: Duration,
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(max_tokens: u32, window: Duration, now: Instant) -> Self {
        Self {
            max_tokens,
            window,
            tokens: max_tokens,
            last_refill: now,
        }
    }

    /// Bucket capacity.
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    /// Refill window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Apply any refills due at `now`.
    pub fn refill(&mut self, now: Instant) {
        if self.window.is_zero() {
            self.tokens = self.max_tokens;
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed < self.window {
            return;
        }

        let windows = elapsed.as_nanos() / self.window.as_nanos();
        let added = windows.saturating_mul(self.max_tokens as u128);
        let tokens = (self.tokens as u128).saturating_add(added);
        self.tokens = tokens.min(self.max_tokens as u128) as u32;

        let consumed = self
            .window
            .saturating_mul(u32::try_from(windows).unwrap_or(u32::MAX));
        self.last_refill = self
            .last_refill
            .checked_add(consumed)
            .unwrap_or(now)
            .min(now);
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Give back a token that was taken but not used. Never exceeds
    /// capacity.
    pub fn restore(&mut self, now: Instant) {
        self.refill(now);
        self.tokens = self.tokens.saturating_add(1).min(self.max_tokens);
    }

    /// Tokens available at `now`.
    pub fn available(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens
    }

    /// Time until a token becomes available. Zero if one is available now.
    pub fn wait_time(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens > 0 {
            return Duration::ZERO;
        }
        self.window
            .saturating_sub(now.saturating_duration_since(self.last_refill))
    }

    /// Status snapshot at `now`.
    pub fn status(&mut self, now: Instant) -> BucketStatus {
        BucketStatus {
            available_tokens: self.available(now),
            max_tokens: self.max_tokens,
            wait_time: self.wait_time(now),
        }
    }
}
