//! Outbound dispatch: single-flight request queue with spacing, backoff and cooldown.

pub mod backoff;
pub mod queue;

pub use backoff::{FixedJitter, Jitter, MAX_RETRY_AFTER, RandomJitter, backoff_delay};
pub use queue::{DispatchQueue, LimiterState};
