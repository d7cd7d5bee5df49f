//! Backoff delay computation and jitter sources.

use rand::Rng as _;
use std::time::Duration;

/// Source of random jitter added to spacing and backoff waits.
pub trait Jitter: Send + Sync + 'static {
    /// A value in `0..=max`.
    fn sample(&self, max: Duration) -> Duration;
}

/// Uniform jitter in whole milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn sample(&self, max: Duration) -> Duration {
        let max_ms = max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

/// Constant jitter, clamped to the requested maximum. Used for deterministic timing.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedJitter(pub Duration);

impl Jitter for FixedJitter {
    fn sample(&self, max: Duration) -> Duration {
        self.0.min(max)
    }
}

/// Longest wait a `retry_after` can impose.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Delay before retrying a throttled request.
///
/// Honors Discord's `retry_after` (seconds, capped at [`MAX_RETRY_AFTER`])
/// when present, otherwise `base * 2^attempt` plus jitter.
pub fn backoff_delay(
    base: Duration,
    attempt: u32,
    retry_after: Option<f64>,
    jitter: Duration,
) -> Duration {
    if let Some(seconds) = retry_after.filter(|seconds| seconds.is_finite() && *seconds >= 0.0) {
        return Duration::try_from_secs_f64(seconds)
            .unwrap_or(MAX_RETRY_AFTER)
            .min(MAX_RETRY_AFTER);
    }

    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor)
        .unwrap_or(Duration::MAX)
        .saturating_add(jitter)
}
