//! Per-service restart circuit breaker.
//!
//! Failures are counted in a sliding window.  Reaching the threshold opens
//! the breaker and suspends restarts.  After the cooldown, exactly one probe
//! restart is permitted (half-open); its outcome closes or reopens the
//! breaker.
//!
//! ```text
//! closed ──threshold failures in window──▶ open
//!   ▲                                       │ cooldown elapsed
//!   └──── probe healthy ──── half_open ◀────┘
//!                               │ probe failed
//!                               └──────────────▶ open
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use fieldos_types::CircuitState;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    cooldown: Duration,
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            cooldown,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Failures still inside the window at `now`.
    fn failures_in_window(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.failures.len() as u32
    }

    /// Time left before a probe is allowed, if open.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => Some(self.cooldown.saturating_sub(now.saturating_duration_since(at))),
            _ => None,
        }
    }

    /// Record a failure and return the resulting state.
    pub fn record_failure(&mut self, now: Instant) -> CircuitState {
        match self.state {
            CircuitState::Closed => {
                self.failures.push_back(now);
                if self.failures_in_window(now) >= self.threshold {
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => self.open(now),
            CircuitState::Open => {}
        }
        self.state
    }

    /// Record that the service came up healthy.
    pub fn record_success(&mut self) -> CircuitState {
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
            self.failures.clear();
            self.opened_at = None;
            self.probe_in_flight = false;
        }
        self.state
    }

    /// Whether a restart may happen now.
    ///
    /// In the open state this moves to half-open once the cooldown has
    /// elapsed and grants the single probe; later calls are refused until the
    /// probe's outcome is recorded.
    pub fn allow_restart(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = self
                    .opened_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= self.cooldown);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                }
                cooled
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Manual reset by an operator.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failures.clear();
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    /// Apply new limits, keeping the recorded history.
    pub fn reconfigure(&mut self, threshold: u32, window: Duration, cooldown: Duration) {
        self.threshold = threshold.max(1);
        self.window = window;
        self.cooldown = cooldown;
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    fn prune(&mut self, now: Instant) {
        while self
            .failures
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > self.window)
        {
            self.failures.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(60), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_within_window() {
        let mut cb = breaker();
        let now = Instant::now();
        assert_eq!(cb.record_failure(now), CircuitState::Closed);
        assert_eq!(cb.record_failure(now), CircuitState::Closed);
        assert_eq!(cb.record_failure(now), CircuitState::Open);
        assert!(!cb.allow_restart(now));
    }

    #[tokio::test(start_paused = true)]
    async fn old_failures_slide_out_of_window() {
        let mut cb = breaker();
        cb.record_failure(Instant::now());
        cb.record_failure(Instant::now());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cb.record_failure(Instant::now()), CircuitState::Closed);
        assert_eq!(cb.failures_in_window(Instant::now()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_probe_after_cooldown_then_close() {
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_failure(Instant::now());
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!cb.allow_restart(Instant::now()));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.allow_restart(Instant::now()));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.allow_restart(Instant::now()));

        assert_eq!(cb.record_success(), CircuitState::Closed);
        assert_eq!(cb.failures_in_window(Instant::now()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_failure(Instant::now());
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.allow_restart(Instant::now()));
        assert_eq!(cb.record_failure(Instant::now()), CircuitState::Open);
        assert_eq!(cb.cooldown_remaining(Instant::now()), Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes() {
        let mut cb = breaker();
        for _ in 0..3 {
            cb.record_failure(Instant::now());
        }
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_restart(Instant::now()));
    }
}
