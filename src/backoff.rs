use std::sync::Arc;

use rand::Rng;

/// Maps the zero-based attempt count of a message to the number of seconds
/// it should stay invisible before being retried.
///
/// The result is clamped by the lease before it reaches SQS, so a policy is
/// free to return anything.
pub type BackoffFn = Arc<dyn Fn(u32) -> u64 + Send + Sync>;

/// `attempt^3 + 15 + rand(0..30) * (attempt + 1)` seconds.
///
/// The jitter only exists to spread retries of a failing batch across a
/// fleet, it is not meant to be unpredictable.
pub fn default_backoff(attempt: u32) -> u64 {
    let jitter = rand::rng().random_range(0..30u64);
    cubic_delay(attempt, jitter)
}

fn cubic_delay(attempt: u32, jitter: u64) -> u64 {
    let attempt = u64::from(attempt);

    attempt
        .saturating_pow(3)
        .saturating_add(15)
        .saturating_add(jitter.saturating_mul(attempt + 1))
}

/// Builds a policy doubling `base` seconds per attempt, capped at `cap`, with
/// full jitter over the upper half of the window.
pub fn exponential_backoff(base: u64, cap: u64) -> BackoffFn {
    Arc::new(move |attempt| {
        let window = base
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
            .min(cap);
        let half = window / 2;
        if half == 0 {
            return window;
        }
        half + rand::rng().random_range(0..=half)
    })
}
