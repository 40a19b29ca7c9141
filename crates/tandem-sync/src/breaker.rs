//! # Circuit Breaker
//!
//! Per-address failure gate. One breaker exists per (logical server, address
//! index) and is never shared across addresses.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Circuit Breaker States                              │
//! │                                                                         │
//! │            failure_count >= threshold                                   │
//! │   ┌────────┐ ─────────────────────────────► ┌────────┐                 │
//! │   │ CLOSED │                                 │  OPEN  │                 │
//! │   └────────┘ ◄──────────┐       ┌─────────── └────────┘                 │
//! │       ▲    success      │       │ any failure     │                     │
//! │       │  resets count   │       │                 │ timeout elapsed     │
//! │       │                 │       │                 ▼ (first caller)      │
//! │       │             ┌───┴───────┴──┐                                    │
//! │       └──────────── │  HALF-OPEN   │  one trial in flight at a time;   │
//! │  success_count      └──────────────┘  concurrent callers get           │
//! │  >= threshold                          BreakerOpen immediately         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only retryable errors (see [`SyncError::is_retryable`]) count as failures.
//! A reachable server answering with a business error is healthy.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker, and consecutive half-open
    /// successes that close it.
    pub threshold: u32,
    /// Cool-down before an open breaker admits a trial.
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            threshold: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-address circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Releases the half-open trial slot if the trial future is dropped before
/// it records an outcome.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state as last recorded.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Returns true if a call made now would be admitted.
    ///
    /// An open breaker whose cool-down has elapsed admits its trial.
    pub fn allows_request(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => !inner.trial_in_flight,
            BreakerState::Open => self.cooled_down(&inner),
        }
    }

    fn cooled_down(&self, inner: &Inner) -> bool {
        inner
            .last_failure
            .map_or(true, |at| at.elapsed() >= self.config.timeout)
    }

    /// Runs `f` through the breaker.
    pub async fn execute<F, Fut, T>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let trial = self.admit()?;
        let mut slot = TrialSlot {
            breaker: self,
            armed: trial,
        };

        let result = f().await;
        slot.armed = false;

        match &result {
            Err(e) if e.is_retryable() => self.record_failure(),
            _ => self.record_success(),
        }
        result
    }

    /// Admits a call. Returns whether it is the half-open trial.
    fn admit(&self) -> SyncResult<bool> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                if self.cooled_down(&inner) {
                    info!(breaker = %self.name, "Breaker half-open, admitting trial");
                    inner.state = BreakerState::HalfOpen;
                    inner.success_count = 0;
                    inner.trial_in_flight = true;
                    Ok(true)
                } else {
                    Err(SyncError::BreakerOpen)
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(SyncError::BreakerOpen)
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.config.threshold {
                    info!(breaker = %self.name, "Breaker closed");
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            // Call admitted while closed, finished after a sibling opened it.
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "Breaker opened"
                    );
                    inner.state = BreakerState::Open;
                }
            }
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "Half-open trial failed, breaker reopened");
                inner.state = BreakerState::Open;
                inner.failure_count += 1;
                inner.success_count = 0;
                inner.trial_in_flight = false;
            }
            BreakerState::Open => {
                debug!(breaker = %self.name, "Late failure on open breaker");
                inner.failure_count += 1;
            }
        }
    }
}
