//! Async circuit breaker guarding one external dependency.
//!
//! # Circuit Breaker States
//!
//! ```text
//! +--------+     failures >= threshold     +------+
//! | Closed | --------------------------->  | Open |
//! +--------+                               +------+
//!     ^                                      ^   |
//!     |  trial succeeds        trial fails   |   | reset timeout elapsed
//!     |                                      |   v
//!     +--------------------------------  +-----------+
//!                                        | Half-Open |
//!                                        +-----------+
//! ```
//!
//! Half-open admits exactly one trial call. Concurrent callers are rejected
//! with [`Error::CircuitOpen`] until the trial finishes.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lokal_resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("postgresql", CircuitBreakerConfig::default());
//! let rows = breaker.execute(|| store.query("SELECT 1", &[])).await?;
//! ```

use crate::config::CircuitBreakerConfig;
use crate::models::{ConnectionEvent, EventMeta};
use crate::observability::EventBus;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

const EVENT_SOURCE: &str = "circuit_breaker";

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// One trial call is deciding whether to close.
    HalfOpen,
}

impl CircuitState {
    /// Returns the state as a numeric value for metrics.
    ///
    /// - 0: Closed
    /// - 1: Open
    /// - 2: Half-Open
    #[must_use]
    pub const fn state_value(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time snapshot of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// Failures needed to open.
    pub failure_threshold: u32,
    /// Open dwell time.
    pub reset_timeout_ms: u64,
    /// Every call submitted to `execute`.
    pub total_requests: u64,
    /// Calls whose operation succeeded.
    pub successful_requests: u64,
    /// Calls whose operation failed, timed out, or was cancelled as a trial.
    pub failed_requests: u64,
    /// Calls rejected without invoking the operation.
    pub rejected_requests: u64,
    /// Wall-clock time of the last success.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Wall-clock time of the last failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Milliseconds until a trial is admitted, while open.
    pub next_attempt_in_ms: Option<u64>,
}

/// How a call got past admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    next_attempt_at: Option<Instant>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Failure-isolation state machine for one dependency.
///
/// State lives behind a short `std::sync::Mutex` section that is never held
/// across an await. Time is read from [`tokio::time::Instant`] so paused-clock
/// tests drive the reset timeout deterministically.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
    event_bus: Option<EventBus>,
}

impl CircuitBreaker {
    /// Creates a new breaker in the closed state.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        metrics::gauge!("circuit_breaker_state", "breaker" => name.clone())
            .set(f64::from(CircuitState::Closed.state_value()));
        Self {
            name,
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: config.reset_timeout(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                next_attempt_at: None,
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
                rejected_requests: 0,
                last_success_at: None,
                last_failure_at: None,
            }),
            event_bus: None,
        }
    }

    /// Publishes `circuit_open` / `circuit_reset` events to `bus`.
    #[must_use]
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Returns the breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state.
    ///
    /// An open breaker whose reset timeout has elapsed still reports `Open`
    /// until the next call arrives to act as the trial.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Returns a snapshot of the breaker counters.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock();
        let next_attempt_in_ms = match inner.state {
            CircuitState::Open => inner
                .next_attempt_at
                .map(|at| duration_ms(at.saturating_duration_since(Instant::now()))),
            CircuitState::Closed | CircuitState::HalfOpen => None,
        };
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            reset_timeout_ms: duration_ms(self.reset_timeout),
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            rejected_requests: inner.rejected_requests,
            last_success_at: inner.last_success_at,
            last_failure_at: inner.last_failure_at,
            next_attempt_in_ms,
        }
    }

    /// Runs `operation` under the breaker.
    ///
    /// The only error this method produces itself is [`Error::CircuitOpen`];
    /// errors from `operation` are returned unchanged after bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] when the call is rejected, or the
    /// operation's own error.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;

        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };
        let result = operation().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.on_success(admission),
            Err(err) => self.on_failure(admission, &err.to_string()),
        }

        result
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self) -> Result<Admission> {
        let mut inner = self.lock();
        inner.total_requests += 1;

        let admission = match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let now = Instant::now();
                match inner.next_attempt_at {
                    Some(at) if now < at => None,
                    _ => {
                        inner.state = CircuitState::HalfOpen;
                        tracing::info!(
                            breaker = %self.name,
                            "Circuit breaker transitioning to half-open"
                        );
                        Some(Admission::Trial)
                    },
                }
            },
            // A trial is already in flight.
            CircuitState::HalfOpen => None,
        };

        let Some(admission) = admission else {
            inner.rejected_requests += 1;
            let retry_after_ms = inner
                .next_attempt_at
                .map_or(0, |at| duration_ms(at.saturating_duration_since(Instant::now())));
            let state = inner.state;
            drop(inner);
            self.record_metrics("rejected", state);
            tracing::debug!(
                breaker = %self.name,
                retry_after_ms,
                "Circuit breaker rejected call"
            );
            return Err(Error::CircuitOpen {
                dependency: self.name.clone(),
                retry_after_ms,
            });
        };

        let state = inner.state;
        drop(inner);
        if admission == Admission::Trial {
            self.record_state(state);
        }
        Ok(admission)
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        inner.successful_requests += 1;
        inner.last_success_at = Some(Utc::now());

        let mut reset = false;
        match (admission, inner.state) {
            (Admission::Trial, _) => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.next_attempt_at = None;
                reset = true;
            },
            (Admission::Normal, CircuitState::Closed) => inner.failure_count = 0,
            // Admitted before the breaker opened; a late success does not close it.
            (Admission::Normal, CircuitState::Open | CircuitState::HalfOpen) => {},
        }
        let state = inner.state;
        drop(inner);

        self.record_metrics("success", state);
        if reset {
            tracing::info!(breaker = %self.name, "Circuit breaker closed after successful trial");
            self.publish(ConnectionEvent::CircuitReset {
                meta: EventMeta::new(EVENT_SOURCE),
                breaker: self.name.clone(),
            });
        }
    }

    fn on_failure(&self, admission: Admission, error: &str) {
        let mut inner = self.lock();
        inner.failed_requests += 1;
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());

        let trip = match (admission, inner.state) {
            (Admission::Trial, _) => true,
            (Admission::Normal, CircuitState::Closed) => {
                inner.failure_count >= self.failure_threshold
            },
            (Admission::Normal, CircuitState::Open | CircuitState::HalfOpen) => false,
        };

        let mut retry_after_ms = 0;
        if trip {
            inner.state = CircuitState::Open;
            inner.next_attempt_at = Some(Instant::now() + self.reset_timeout);
            retry_after_ms = duration_ms(self.reset_timeout);
        }
        let failure_count = inner.failure_count;
        let state = inner.state;
        drop(inner);

        self.record_metrics("error", state);
        if !trip {
            return;
        }

        if admission == Admission::Trial {
            tracing::warn!(
                breaker = %self.name,
                error,
                "Circuit breaker re-opened after half-open failure"
            );
        } else {
            tracing::warn!(
                breaker = %self.name,
                failures = failure_count,
                threshold = self.failure_threshold,
                error,
                "Circuit breaker opened after consecutive failures"
            );
        }
        metrics::counter!("circuit_breaker_trips_total", "breaker" => self.name.clone())
            .increment(1);
        self.publish(ConnectionEvent::CircuitOpened {
            meta: EventMeta::new(EVENT_SOURCE),
            breaker: self.name.clone(),
            failure_count,
            error: error.to_string(),
            retry_after_ms,
        });
    }

    fn publish(&self, event: ConnectionEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    fn record_metrics(&self, status: &'static str, state: CircuitState) {
        metrics::counter!(
            "circuit_breaker_requests_total",
            "breaker" => self.name.clone(),
            "status" => status
        )
        .increment(1);
        self.record_state(state);
    }

    fn record_state(&self, state: CircuitState) {
        metrics::gauge!("circuit_breaker_state", "breaker" => self.name.clone())
            .set(f64::from(state.state_value()));
    }
}

/// Counts a trial as failed if its future is dropped before completing.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker
                .on_failure(Admission::Trial, "trial call cancelled before completion");
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
