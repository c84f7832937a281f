//! Backoff delay calculation.
//!
//! Two flavours are used by the engine:
//! - [`calculate_backoff`]: exponential with ±10% jitter, for retrying remote
//!   API calls so that concurrent workers do not retry in lockstep.
//! - [`job_backoff`]: plain exponential, for re-scheduling failed queue jobs.

use std::time::Duration;

/// Retry delay for a remote call.
///
/// Formula: `min(base * 2^attempt, max)`, then jitter uniformly within ±10%,
/// floored to whole milliseconds. `attempt` counts from 0 for the first
/// retry.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let delay = capped_exponential(attempt, base, max).as_millis() as f64;
    let jitter = delay * 0.1 * (random_unit() * 2.0 - 1.0);
    Duration::from_millis((delay + jitter).floor().max(0.0) as u64)
}

/// Delay before a failed queue job becomes eligible again.
///
/// Formula: `base * 2^(attempts_made - 1)`. No jitter.
pub fn job_backoff(attempts_made: u32, base: Duration) -> Duration {
    let exp = attempts_made.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exp)
}

fn capped_exponential(attempt: u32, base: Duration, max: Duration) -> Duration {
    // 2^31 already overflows any sensible max, clamp the shift.
    let factor = 1u32 << attempt.min(31);
    base.saturating_mul(factor).min(max)
}

/// Uniform random number in [0, 1).
///
/// Falls back to 0.5 (no jitter) if the OS source is unavailable.
fn random_unit() -> f64 {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return 0.5;
    }
    // 53 random bits fill an f64 mantissa.
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}
