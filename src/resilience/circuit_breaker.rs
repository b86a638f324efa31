//! Circuit breaker usable as a fusing gate.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: handlers assumed failing, requests are rejected fast
//! - Half-Open: one trial request is let through
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= threshold
//! Open → Half-Open: after recovery timeout
//! Half-Open → Closed: trial request succeeds
//! Half-Open → Open: trial request fails
//! ```
//!
//! # Design Decisions
//! - A response status >= 500 counts as a failure
//! - Single trial request in Half-Open (prevents hammering a recovering route)
//! - Once admitted, a request is not re-judged at later hops unless the
//!   breaker has opened in the meantime

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::http::RequestContext;
use crate::resilience::strategy::Gate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("circuit breaker mutex poisoned").state
    }

    /// Decide whether a new request may pass.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.recovery_timeout);
                if recovered {
                    tracing::info!("Circuit breaker half-open, admitting trial request");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                }
                recovered
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                tracing::info!("Circuit breaker closed");
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.failure_threshold {
                    tracing::warn!(failures = inner.failures, "Circuit breaker opened");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("Circuit breaker trial request failed, reopening");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }
}

impl Gate for CircuitBreaker {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    fn deny(&self, _ctx: &RequestContext, first_check: bool) -> bool {
        if first_check {
            !self.allow()
        } else {
            self.state() == CircuitState::Open
        }
    }

    fn record(&self, status: u16) {
        if status >= 500 {
            self.on_failure();
        } else {
            self.on_success();
        }
    }
}
