//! Jitter applied to retry delays so concurrent callers do not retry in lockstep.
//!
//! - `None`: deterministic delays for tests or tightly controlled workflows.
//! - `Proportional(ratio)`: additive jitter, uniform in `[delay, delay * (1 + ratio)]`. The
//!   default ratio is 0.1, so a jittered delay never falls below the computed backoff and never
//!   exceeds it by more than 10%.
//!
//! Notes:
//! - RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//!   `apply_with_rng`.
//! - Precision: millisecond conversions saturate to `u64::MAX` to avoid panics on very large
//!   durations.

use rand::{rng, Rng};
use std::time::Duration;

/// Default additive jitter ratio (10%).
pub const DEFAULT_JITTER_RATIO: f64 = 0.1;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Add up to `ratio * delay` on top of the delay.
    Proportional(f64),
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::Proportional(DEFAULT_JITTER_RATIO)
    }
}

impl Jitter {
    /// Additive jitter with a custom ratio. Negative or non-finite ratios disable jitter.
    pub fn proportional(ratio: f64) -> Self {
        if ratio.is_finite() && ratio > 0.0 {
            Jitter::Proportional(ratio)
        } else {
            Jitter::None
        }
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Proportional(ratio) => {
                let millis = as_millis_saturated(delay);
                if millis == 0 || !ratio.is_finite() || ratio <= 0.0 {
                    return delay;
                }
                let spread = (millis as f64 * ratio).floor();
                let spread = if spread >= u64::MAX as f64 { u64::MAX } else { spread as u64 };
                let extra = rng.random_range(0..=spread);
                delay.saturating_add(Duration::from_millis(extra))
            }
        }
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
