use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_RESET_TIMEOUT_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { until: DateTime<Utc> },
    HalfOpen { trial_in_flight: bool },
}

/// Failure-isolation for actuator calls.
///
/// Closed counts consecutive failures; reaching the threshold opens the
/// breaker for `reset_timeout`. Once that window has passed, the next
/// [`CircuitBreaker::can_attempt`] moves to half-open and grants exactly one
/// trial. Retry pacing belongs to the caller.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: TimeDelta,
    state: BreakerState,
    failures: u32,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(
            DEFAULT_FAILURE_THRESHOLD,
            TimeDelta::seconds(DEFAULT_RESET_TIMEOUT_SECS),
        )
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: TimeDelta) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            state: BreakerState::Closed,
            failures: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn can_attempt(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open { until } if now >= until => {
                self.state = BreakerState::HalfOpen {
                    trial_in_flight: true,
                };
                true
            }
            BreakerState::Open { .. } => false,
            BreakerState::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    return false;
                }
                self.state = BreakerState::HalfOpen {
                    trial_in_flight: true,
                };
                true
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            info!("boiler circuit breaker closed after successful call");
        }
        self.state = BreakerState::Closed;
        self.failures = 0;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        if matches!(self.state, BreakerState::HalfOpen { .. }) {
            self.open(now, "half-open trial failed");
            return;
        }
        self.failures += 1;
        if self.failures >= self.failure_threshold {
            self.open(now, "failure threshold reached");
        }
    }

    /// Time until the breaker will accept a call again; zero unless open.
    pub fn next_attempt_in(&self, now: DateTime<Utc>) -> TimeDelta {
        match self.state {
            BreakerState::Open { until } if until > now => until - now,
            _ => TimeDelta::zero(),
        }
    }

    fn open(&mut self, now: DateTime<Utc>, reason: &str) {
        self.state = BreakerState::Open {
            until: now + self.reset_timeout,
        };
        self.failures = 0;
        warn!(
            reason,
            retry_after_secs = self.reset_timeout.num_seconds(),
            "boiler circuit breaker opened"
        );
    }
}
