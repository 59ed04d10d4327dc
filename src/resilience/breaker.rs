//! Circuit breaker guarding the backing audit store.
//!
//! CLOSED → OPEN after `failure_threshold` consecutive failures. OPEN refuses
//! immediately until `recovery_timeout` has elapsed, then admits exactly one
//! trial call (HALF_OPEN). The trial's outcome closes the circuit or re-opens
//! it with a fresh timer. Callers arriving while the trial is in flight are
//! refused.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::BreakerSettings;
use crate::error::{Result, SecurityError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// A guard that runs fallible calls and may refuse them up front.
pub trait Protected: Send + Sync {
    fn call<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T>;
}

pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    recovery_timeout: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

/// How a call was admitted.
enum Admission {
    Normal,
    Trial,
}

/// Pending outcome of an admitted call. A call that unwinds before
/// reporting is recorded as a failure when this drops.
struct Pending<'a> {
    breaker: &'a CircuitBreaker,
    admission: Option<Admission>,
}

impl Pending<'_> {
    fn finish(mut self, success: bool) {
        if let Some(admission) = self.admission.take() {
            self.breaker.record(admission, success);
        }
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            warn!("Circuit breaker '{}' call unwound", self.breaker.name);
            self.breaker.record(admission, false);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: &'static str, settings: &BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            failure_threshold: settings.failure_threshold,
            recovery_timeout: settings.recovery_timeout,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    fn admit(&self) -> Result<Admission> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| self.clock.now().saturating_duration_since(at))
                    .unwrap_or(self.recovery_timeout);
                if elapsed >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!("Circuit breaker '{}' half-open, admitting trial call", self.name);
                    Ok(Admission::Trial)
                } else {
                    Err(SecurityError::CircuitBreakerOpen {
                        retry_in: self.recovery_timeout - elapsed,
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(SecurityError::CircuitBreakerOpen {
                        retry_in: Duration::ZERO,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    fn record(&self, admission: Admission, success: bool) {
        let mut inner = self.lock();
        match (admission, success) {
            (Admission::Trial, true) => {
                inner.state = BreakerState::Closed;
                inner.failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                info!("Circuit breaker '{}' closed after successful trial", self.name);
            }
            (Admission::Trial, false) => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(self.clock.now());
                inner.trial_in_flight = false;
                warn!("Circuit breaker '{}' trial failed, re-opening", self.name);
            }
            (Admission::Normal, true) => {
                inner.failures = 0;
            }
            (Admission::Normal, false) => {
                inner.failures = inner.failures.saturating_add(1);
                // A concurrent trial may already have changed the state
                if inner.state == BreakerState::Closed && inner.failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(self.clock.now());
                    warn!(
                        "Circuit breaker '{}' opened after {} consecutive failures",
                        self.name, inner.failures
                    );
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Protected for CircuitBreaker {
    /// Run `f` through the breaker. Any error from `f` counts as a failure.
    fn call<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let pending = Pending {
            breaker: self,
            admission: Some(self.admit()?),
        };
        let result = f();
        pending.finish(result.is_ok());
        result
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_timeout", &self.recovery_timeout)
            .finish()
    }
}
