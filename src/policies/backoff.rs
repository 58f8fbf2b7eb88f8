//! # Backoff policy for reconnects, redelivery and outbox commits.
//!
//! [`BackoffPolicy`] computes the delay before retry number `n` as
//! `first × factor^n`, clamped to `max`, then applies [`JitterPolicy`].
//! The base delay depends only on the attempt number, so jitter output never
//! feeds back into later delays.
//!
//! Two presets mirror the relay's retry contracts:
//! - [`BackoffPolicy::reconnect`]: 1s base, 30s cap, full jitter (listener)
//! - [`BackoffPolicy::delivery`]: 250ms base, 1min cap, equal jitter (dispatcher)
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use orders_relay::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(250),
//!     max: Duration::from_secs(60),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(0), Duration::from_millis(250));
//! assert_eq!(backoff.next(2), Duration::from_secs(1));
//! assert_eq!(backoff.next(20), Duration::from_secs(60));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Exponential retry backoff.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
    /// Randomization applied to the clamped delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Same as [`BackoffPolicy::delivery`].
    fn default() -> Self {
        Self::delivery()
    }
}

impl BackoffPolicy {
    /// Listener reconnect schedule: base 1s, cap 30s, doubling, full jitter.
    pub const fn reconnect() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::Full,
        }
    }

    /// Subscriber redelivery schedule: base 250ms, cap 1min, doubling, equal jitter.
    pub const fn delivery() -> Self {
        Self {
            first: Duration::from_millis(250),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: JitterPolicy::Equal,
        }
    }

    /// Returns a copy without jitter. Handy for deterministic tests.
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = JitterPolicy::None;
        self
    }

    /// Computes the delay for the given retry number (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        self.jitter.apply(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_preset_grows_to_cap() {
        let p = BackoffPolicy::reconnect().without_jitter();
        assert_eq!(p.next(0), Duration::from_secs(1));
        assert_eq!(p.next(1), Duration::from_secs(2));
        assert_eq!(p.next(4), Duration::from_secs(16));
        assert_eq!(p.next(5), Duration::from_secs(30));
        assert_eq!(p.next(50), Duration::from_secs(30));
    }

    #[test]
    fn test_delivery_preset_grows_to_cap() {
        let p = BackoffPolicy::delivery().without_jitter();
        assert_eq!(p.next(0), Duration::from_millis(250));
        assert_eq!(p.next(1), Duration::from_millis(500));
        assert_eq!(p.next(7), Duration::from_secs(32));
        assert_eq!(p.next(8), Duration::from_secs(60));
    }

    #[test]
    fn test_full_jitter_never_exceeds_base() {
        let p = BackoffPolicy::reconnect();
        for attempt in 0..12 {
            let base = BackoffPolicy::reconnect().without_jitter().next(attempt);
            assert!(p.next(attempt) <= base, "attempt {attempt}");
        }
    }

    #[test]
    fn test_first_exceeds_max() {
        let p = BackoffPolicy {
            first: Duration::from_secs(10),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter: JitterPolicy::None,
        };
        assert_eq!(p.next(0), Duration::from_secs(5));
    }

    #[test]
    fn test_overflow_clamps_to_max() {
        let p = BackoffPolicy::delivery().without_jitter();
        assert_eq!(p.next(u32::MAX), Duration::from_secs(60));
    }
}
