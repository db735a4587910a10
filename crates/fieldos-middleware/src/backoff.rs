//! Exponential backoff with additive jitter.
//!
//! The delay for attempt `n` (0-indexed) is `first × factor^n`, clamped to
//! `max`, plus a uniformly random extra in `[0, jitter × base]`.  The base is
//! derived from the attempt number alone, so jitter never feeds back into
//! later delays.
//!
//! ```rust
//! use std::time::Duration;
//! use fieldos_middleware::Backoff;
//!
//! let backoff = Backoff {
//!     first: Duration::from_millis(100),
//!     max: Duration::from_secs(10),
//!     factor: 2.0,
//!     jitter: 0.0,
//! };
//! assert_eq!(backoff.delay(1), Duration::from_millis(200));
//! assert_eq!(backoff.delay(10), Duration::from_secs(10));
//! ```

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub first: Duration,
    /// Cap applied before jitter.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
    /// Upper bound of the additive jitter, as a fraction of the base delay.
    pub jitter: f64,
}

impl Default for Backoff {
    /// 500 ms doubling up to 30 s with up to 10 % jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// Un-jittered delay for `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay for `attempt` including jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        base + base.mul_f64(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter: f64) -> Backoff {
        Backoff {
            first: Duration::from_millis(100),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn exponential_growth_without_jitter() {
        let b = backoff(0.0);
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(4), Duration::from_millis(1600));
    }

    #[test]
    fn clamped_to_max() {
        let b = backoff(0.0);
        assert_eq!(b.delay(20), Duration::from_secs(30));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let b = backoff(0.1);
        for attempt in 0..8 {
            let base = b.base_delay(attempt);
            for _ in 0..100 {
                let d = b.delay(attempt);
                assert!(d >= base);
                assert!(d <= base + base.mul_f64(0.1) + Duration::from_nanos(1));
            }
        }
    }

    #[test]
    fn jittered_delays_strictly_increase_below_cap() {
        let b = backoff(0.1);
        for attempt in 0..6 {
            assert!(b.delay(attempt + 1) > b.delay(attempt));
        }
    }
}
