//! Restart policy: whether a stopped service comes back, and after how long.
//!
//! The delay after `n` consecutive failures is `base × 2^n`, capped at
//! `max_delay`, plus up to 10 % additive jitter.

use std::time::Duration;

use fieldos_middleware::Backoff;
use fieldos_types::RestartPolicyKind;

/// How a service process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit status 0.
    Clean,
    /// Non-zero exit, signal, missed heartbeats or startup timeout.
    Failure(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    pub kind: RestartPolicyKind,
    pub max_restarts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RestartPolicy {
    pub const JITTER: f64 = 0.1;

    fn backoff(&self) -> Backoff {
        Backoff {
            first: self.base_delay,
            max: self.max_delay,
            factor: 2.0,
            jitter: Self::JITTER,
        }
    }

    /// Whether an exit of this kind warrants a restart at all.
    pub fn restarts_on(&self, exit: &ExitKind) -> bool {
        match (self.kind, exit) {
            (RestartPolicyKind::Never, _) => false,
            (RestartPolicyKind::Always, _) => true,
            (RestartPolicyKind::OnFailure, ExitKind::Failure(_)) => true,
            (RestartPolicyKind::OnFailure, ExitKind::Clean) => false,
        }
    }

    /// Delay before the next restart after `consecutive_failures` failures.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        self.backoff().delay(consecutive_failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(kind: RestartPolicyKind) -> RestartPolicy {
        RestartPolicy {
            kind,
            max_restarts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }

    #[test]
    fn delays_strictly_increase_and_respect_jitter_bound() {
        let p = policy(RestartPolicyKind::OnFailure);
        let mut previous = Duration::ZERO;
        for n in 0..p.max_restarts {
            let d = p.delay(n);
            let bound = Duration::from_secs(1) * 2u32.pow(n);
            assert!(d > previous);
            assert!(d >= bound);
            assert!(d <= bound + bound.mul_f64(0.1) + Duration::from_nanos(1));
            previous = d;
        }
    }

    #[test]
    fn cap_applies() {
        let p = policy(RestartPolicyKind::Always);
        let d = p.delay(20);
        assert!(d >= Duration::from_secs(300));
        assert!(d <= Duration::from_secs(330));
    }

    #[test]
    fn policy_kinds() {
        let failure = ExitKind::Failure("exit status 1".into());
        assert!(policy(RestartPolicyKind::Always).restarts_on(&ExitKind::Clean));
        assert!(policy(RestartPolicyKind::OnFailure).restarts_on(&failure));
        assert!(!policy(RestartPolicyKind::OnFailure).restarts_on(&ExitKind::Clean));
        assert!(!policy(RestartPolicyKind::Never).restarts_on(&failure));
    }
}
