//! Per-provider circuit breaker.
//!
//! CLOSED passes calls through and counts consecutive failures. Reaching
//! the threshold opens the circuit; OPEN rejects without calling until the
//! reset timeout has passed since the last failure, then admits a single
//! HALF_OPEN trial whose outcome closes or re-opens the circuit.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the circuit stays open before a trial call (default: 60s)
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout() -> u64 {
    60_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout(),
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of asking the breaker for permission to call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, call normally
    Allowed,
    /// This call is the single half-open trial
    Trial,
    /// Circuit open; do not call
    Rejected { retry_after: Duration },
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub retry_after_ms: Option<u64>,
}

/// Breaker state for a single provider
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_started: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            trial_started: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Decide whether a call may proceed at `now`
    pub fn admit(&mut self, now: Instant) -> Admission {
        let reset_timeout = self.config.reset_timeout();

        match self.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let elapsed = self
                    .last_failure
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(reset_timeout);

                if elapsed >= reset_timeout {
                    self.state = BreakerState::HalfOpen;
                    self.trial_started = Some(now);
                    Admission::Trial
                } else {
                    Admission::Rejected {
                        retry_after: reset_timeout - elapsed,
                    }
                }
            }
            BreakerState::HalfOpen => match self.trial_started {
                // A trial whose caller vanished without reporting back is
                // abandoned after one reset window.
                Some(started) if now.saturating_duration_since(started) < reset_timeout => {
                    Admission::Rejected {
                        retry_after: reset_timeout - now.saturating_duration_since(started),
                    }
                }
                _ => {
                    self.trial_started = Some(now);
                    Admission::Trial
                }
            },
        }
    }

    /// Record a successful call
    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.trial_started = None;
    }

    /// Record a failed call at `now`
    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        self.trial_started = None;

        match self.state {
            BreakerState::HalfOpen => self.state = BreakerState::Open,
            BreakerState::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                self.state = BreakerState::Open
            }
            _ => {}
        }
    }

    /// Force the circuit closed
    pub fn reset(&mut self) {
        self.record_success();
        self.last_failure = None;
    }

    pub fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        let retry_after = match self.state {
            BreakerState::Open => self.last_failure.map(|at| {
                self.config
                    .reset_timeout()
                    .saturating_sub(now.saturating_duration_since(at))
            }),
            _ => None,
        };

        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        }
    }
}
