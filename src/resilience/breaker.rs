//! Sliding-window circuit breaker.
//!
//! # States
//!
//! - **Closed**: normal operation; call outcomes feed a sliding window.
//! - **Open**: requests are rejected until the open-wait elapses.
//! - **Half-Open**: a bounded number of trial calls probe recovery.
//!
//! The circuit opens when, over at least `min_calls` sampled calls, either
//! the failure rate or the slow-call rate (calls slower than
//! `slow_call_secs`) exceeds its threshold. A successful half-open trial
//! closes the circuit; any half-open failure reopens it.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::BreakerSettings;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Error returned when the circuit rejects a call.
#[derive(Debug, Error)]
#[error("circuit breaker '{dependency}' is open")]
pub struct CircuitOpenError {
    pub dependency: Arc<str>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    failure: bool,
    slow: bool,
}

struct Inner {
    state: CircuitState,
    window: VecDeque<Sample>,
    opened_at: Option<Instant>,
    trials_started: u32,
}

/// Thread-safe sliding-window circuit breaker.
pub struct CircuitBreaker {
    dependency: Arc<str>,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<Arc<str>>, settings: BreakerSettings) -> Self {
        Self {
            dependency: dependency.into(),
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                trials_started: 0,
            }),
        }
    }

    /// Ask permission to make a call.
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.settings.open_wait() {
                    inner.state = CircuitState::HalfOpen;
                    inner.trials_started = 1;
                    info!(dependency = %self.dependency, "circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        dependency: self.dependency.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trials_started < self.settings.half_open_trials {
                    inner.trials_started += 1;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        dependency: self.dependency.clone(),
                    })
                }
            }
        }
    }

    /// Record a completed call.
    pub fn record_success(&self, duration: Duration) {
        self.record(Sample {
            failure: false,
            slow: duration.as_secs_f64() > self.settings.slow_call_secs,
        });
    }

    /// Record a failed call. Timeouts count here too.
    pub fn record_failure(&self, duration: Duration) {
        self.record(Sample {
            failure: true,
            slow: duration.as_secs_f64() > self.settings.slow_call_secs,
        });
    }

    fn record(&self, sample: Sample) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.window.push_back(sample);
                while inner.window.len() > self.settings.window_size {
                    inner.window.pop_front();
                }
                if self.window_breaches(&inner.window) {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                if sample.failure {
                    self.open(&mut inner);
                } else {
                    inner.state = CircuitState::Closed;
                    inner.window.clear();
                    inner.opened_at = None;
                    inner.trials_started = 0;
                    info!(dependency = %self.dependency, "circuit breaker closed, recovered");
                }
            }
            // A straggler from before the circuit opened; nothing to learn.
            CircuitState::Open => {}
        }
    }

    fn window_breaches(&self, window: &VecDeque<Sample>) -> bool {
        if window.len() < self.settings.min_calls {
            return false;
        }
        let len = window.len() as f64;
        let failures = window.iter().filter(|s| s.failure).count() as f64;
        let slow = window.iter().filter(|s| s.slow).count() as f64;
        failures / len > self.settings.failure_rate_threshold
            || slow / len > self.settings.slow_rate_threshold
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.window.clear();
        inner.trials_started = 0;
        warn!(
            dependency = %self.dependency,
            wait_secs = self.settings.open_wait_secs,
            "circuit breaker opened"
        );
    }

    /// Current state. Open circuits whose wait has elapsed read as half-open.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.settings.open_wait() {
                return CircuitState::HalfOpen;
            }
        }
        inner.state
    }

    /// Whether calls may currently be attempted. Half-open counts as up.
    pub fn is_up(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }
}
