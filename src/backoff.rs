//! Backoff strategies for the retry engine.
//!
//! Attempt semantics: attempt index `0` represents the initial call (no delay), and retries start
//! at `attempt = 1`. The exponential strategy computes `initial * multiplier^(attempt - 1)`,
//! capped at `max`. Delays saturate at [`MAX_BACKOFF`] to avoid overflow.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use backstop::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(0)); // initial call
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```

use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackoffError {
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
    #[error("multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(f64),
}

/// Exponential delay schedule between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Option<Duration>,
}

impl Backoff {
    /// Doubling backoff starting at `base`.
    pub fn exponential(base: Duration) -> Self {
        Self { base, multiplier: 2.0, max: None }
    }

    /// Growth factor between consecutive retries.
    pub fn with_multiplier(mut self, factor: f64) -> Result<Self, BackoffError> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(BackoffError::InvalidMultiplier(factor));
        }
        self.multiplier = factor;
        Ok(self)
    }

    /// Cap the delay. Returns an error on a zero `max` or `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    /// Delay before `attempt` (0-based; 0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let nanos = self.base.as_nanos() as f64 * self.multiplier.powi(exponent);
        let exp_delay = if nanos.is_finite() && nanos < MAX_BACKOFF.as_nanos() as f64 {
            Duration::from_nanos(nanos.round() as u64)
        } else {
            MAX_BACKOFF
        };
        self.max.map_or(exp_delay, |m| exp_delay.min(m)).min(MAX_BACKOFF)
    }

    /// Configured cap, if any.
    pub fn max(&self) -> Option<Duration> {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_each_time() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100)); // 100 * 2^0
        assert_eq!(backoff.delay(2), Duration::from_millis(200)); // 100 * 2^1
        assert_eq!(backoff.delay(3), Duration::from_millis(400)); // 100 * 2^2
        assert_eq!(backoff.delay(5), Duration::from_millis(1600)); // 100 * 2^4
    }

    #[test]
    fn custom_multiplier_is_applied() {
        let backoff =
            Backoff::exponential(Duration::from_millis(100)).with_multiplier(3.0).unwrap();
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(300));
        assert_eq!(backoff.delay(3), Duration::from_millis(900));
    }

    #[test]
    fn exponential_backoff_respects_max() {
        let backoff = Backoff::exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(1))
            .unwrap();

        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_secs(1)); // Capped
        assert_eq!(backoff.delay(10), Duration::from_secs(1)); // Still capped
        assert_eq!(backoff.max(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn exponential_backoff_handles_overflow() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(1_000_000_000), MAX_BACKOFF);
        assert_eq!(backoff.delay(usize::MAX), MAX_BACKOFF);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(100)).with_max(Duration::from_secs(50)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(1)).with_max(Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        ));
        assert!(Backoff::exponential(Duration::from_secs(1)).with_multiplier(0.5).is_err());
        assert!(Backoff::exponential(Duration::from_secs(1)).with_multiplier(f64::NAN).is_err());
    }

    #[test]
    fn zero_base_behaves() {
        let exp = Backoff::exponential(Duration::ZERO);
        assert_eq!(exp.delay(3), Duration::ZERO);
    }
}
