//! # Circuit Breaker
//!
//! Guards the generation service with a sliding window of call outcomes.
//!
//! ```text
//! Closed   -> Open:     window holds >= min_samples and failure ratio >= threshold
//! Open     -> HalfOpen: first admission after open_timeout, admitted as the probe
//! HalfOpen -> Closed:   probe succeeds
//! HalfOpen -> Open:     probe fails (open timestamp refreshed)
//! ```

use crate::config::BreakerConfig;
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(name)
    }
}

/// Verdict for one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// The single recovery probe; its outcome decides the next state.
    Probe,
    Reject,
    /// A probe is outstanding, try again once it resolves.
    Hold,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    opened_at: Option<Instant>,
    outcomes: VecDeque<(Instant, bool)>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        info!(
            min_samples = config.min_samples,
            failure_threshold = config.failure_threshold,
            open_timeout_ms = config.open_timeout.as_millis() as u64,
            "Circuit breaker initialized"
        );
        Self {
            config,
            state: CircuitState::Closed,
            opened_at: None,
            outcomes: VecDeque::new(),
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Decides whether a call may go to the generation service now.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allow,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(self.config.open_timeout);
                if elapsed >= self.config.open_timeout {
                    self.transition_to_half_open();
                    self.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen if self.probe_in_flight => Admission::Hold,
            CircuitState::HalfOpen => {
                self.probe_in_flight = true;
                Admission::Probe
            }
        }
    }

    /// Appends an outcome to the window and applies any state transition.
    pub fn record(&mut self, success: bool, probe: bool, now: Instant) {
        self.outcomes.push_back((now, success));
        self.prune(now);

        match self.state {
            CircuitState::Closed => {
                if self.should_trip() {
                    self.transition_to_open(now);
                }
            }
            CircuitState::HalfOpen if probe => {
                self.probe_in_flight = false;
                if success {
                    self.transition_to_closed();
                } else {
                    self.transition_to_open(now);
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                debug!(state = %self.state, success, "Outcome recorded outside closed state");
            }
        }
    }

    /// Releases an admitted probe that never reached the service.
    pub fn abandon_probe(&mut self) {
        self.probe_in_flight = false;
    }

    pub fn window_counts(&self, now: Instant) -> (usize, usize) {
        self.outcomes
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= self.config.window)
            .fold((0, 0), |(total, failures), (_, success)| {
                (total + 1, failures + usize::from(!success))
            })
    }

    pub fn failure_rate(&self, now: Instant) -> f64 {
        match self.window_counts(now) {
            (0, _) => 0.0,
            (total, failures) => failures as f64 / total as f64,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.outcomes.front() {
            if now.saturating_duration_since(*at) > self.config.window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn should_trip(&self) -> bool {
        let total = self.outcomes.len();
        if total < self.config.min_samples || total == 0 {
            return false;
        }
        let failures = self.outcomes.iter().filter(|(_, success)| !success).count();
        failures as f64 / total as f64 >= self.config.failure_threshold
    }

    fn transition_to_open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        let (total, failures) = (
            self.outcomes.len(),
            self.outcomes.iter().filter(|(_, s)| !s).count(),
        );
        error!(
            samples = total,
            failures,
            open_timeout_ms = self.config.open_timeout.as_millis() as u64,
            "Circuit breaker opened, serving fallback content"
        );
    }

    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        info!("Circuit breaker half-open, probing generation service");
    }

    /// A recovered breaker starts a fresh episode with an empty window.
    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.outcomes.clear();
        info!("Circuit breaker closed, generation service recovered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> BreakerConfig {
        BreakerConfig {
            window: Duration::from_secs(60),
            min_samples: 10,
            failure_threshold: 0.7,
            open_timeout: Duration::from_secs(30),
        }
    }

    fn trip(breaker: &mut CircuitBreaker, now: Instant) {
        for i in 0..10 {
            breaker.record(i >= 8, false, now);
        }
    }

    #[test]
    fn test_opens_at_eighty_percent_failures() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();

        for i in 0..9 {
            breaker.record(i >= 8, false, now);
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        // 10th sample: 8 failures, 2 successes.
        breaker.record(true, false, now);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.opened_at(), Some(now));
    }

    #[test]
    fn test_stays_closed_below_min_samples() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..9 {
            breaker.record(false, false, now);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.admit(now), Admission::Allow);
    }

    #[test]
    fn test_stays_closed_below_threshold() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        for i in 0..20 {
            breaker.record(i % 2 == 0, false, now);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_once_per_episode() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        trip(&mut breaker, now);
        let opened = breaker.opened_at();

        let later = now + Duration::from_secs(1);
        breaker.record(false, false, later);
        breaker.record(false, false, later);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.opened_at(), opened);
    }

    #[test]
    fn test_rejects_until_timeout_then_probes() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        trip(&mut breaker, now);

        assert_eq!(breaker.admit(now + Duration::from_secs(29)), Admission::Reject);
        assert_eq!(breaker.admit(now + Duration::from_secs(30)), Admission::Probe);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.admit(now + Duration::from_secs(30)), Admission::Hold);
    }

    #[test]
    fn test_probe_success_closes() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        trip(&mut breaker, now);

        let probe_at = now + Duration::from_secs(31);
        assert_eq!(breaker.admit(probe_at), Admission::Probe);
        breaker.record(true, true, probe_at);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.admit(probe_at), Admission::Allow);
        assert_eq!(breaker.window_counts(probe_at), (0, 0));
    }

    #[test]
    fn test_probe_failure_reopens_with_fresh_timestamp() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        trip(&mut breaker, now);

        let probe_at = now + Duration::from_secs(31);
        assert_eq!(breaker.admit(probe_at), Admission::Probe);
        breaker.record(false, true, probe_at);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.opened_at(), Some(probe_at));
        assert_eq!(breaker.admit(probe_at + Duration::from_secs(10)), Admission::Reject);
    }

    #[test]
    fn test_late_outcome_does_not_resolve_probe() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        trip(&mut breaker, now);

        let probe_at = now + Duration::from_secs(31);
        breaker.admit(probe_at);
        breaker.record(true, false, probe_at);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.admit(probe_at), Admission::Hold);
    }

    #[test]
    fn test_abandoned_probe_can_be_readmitted() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        trip(&mut breaker, now);

        let probe_at = now + Duration::from_secs(31);
        assert_eq!(breaker.admit(probe_at), Admission::Probe);
        breaker.abandon_probe();
        assert_eq!(breaker.admit(probe_at), Admission::Probe);
    }

    #[test]
    fn test_window_prunes_old_outcomes() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..9 {
            breaker.record(false, false, now);
        }
        let later = now + Duration::from_secs(61);
        breaker.record(false, false, later);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.window_counts(later), (1, 1));
        assert_eq!(breaker.failure_rate(later), 1.0);
    }
}
