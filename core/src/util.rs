use rand::Rng;
use std::time::Duration;

const MAX_EXPONENT: u32 = 10;
const JITTER_MS: u64 = 250;

/// Retry delay for the given attempt (1-based):
/// `min(max_delay, base * 2^min(10, attempt))` plus up to 250 ms of jitter.
pub(crate) fn backoff_with(base: Duration, max: Duration, attempt: u64) -> Duration {
    let exponent = attempt.min(u64::from(MAX_EXPONENT)) as u32;
    let scaled = base.saturating_mul(2u32.saturating_pow(exponent)).min(max);
    let jitter = rand::rng().random_range(0..JITTER_MS);
    scaled + Duration::from_millis(jitter)
}

/// Retry delay with the default base of 250 ms capped at 60 s.
pub fn retry_backoff(attempt: u64) -> Duration {
    backoff_with(Duration::from_millis(250), Duration::from_secs(60), attempt)
}
