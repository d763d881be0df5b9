//! Per-instance circuit breaker.
//!
//! ```text
//! CLOSED --failure_threshold consecutive failures--> OPEN
//! OPEN   --recovery_timeout since last failure, on next call--> HALF_OPEN
//! HALF_OPEN --success_threshold successes--> CLOSED
//! HALF_OPEN --any failure--> OPEN
//! ```
//!
//! While HALF_OPEN at most `success_threshold` probes are in flight; further
//! callers are rejected as if the breaker were still open.
//!
//! The state lives behind a mutex that is never held across an await, so
//! one breaker can be shared by every engine talking to the same instance.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;

/// Errors that can say whether they indicate an unhealthy remote.
///
/// Errors returning `false` pass through the breaker without touching its counters.
pub trait BreakerFailure {
    fn trips_breaker(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error("circuit '{name}' is open; retry in {retry_in:?}")]
    Open { name: String, retry_in: Duration },
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    in_flight_probes: u32,
    /// Bumped on every entry to HALF_OPEN so probes from an earlier round release nothing.
    probe_round: u64,
    last_failure: Option<Instant>,
}

/// Held for the duration of a HALF_OPEN probe; frees its slot even if the call is dropped.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    round: u64,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        let mut inner = self.breaker.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_round == self.round {
            inner.in_flight_probes = inner.in_flight_probes.saturating_sub(1);
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                in_flight_probes: 0,
                probe_round: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, applying the lazy OPEN to HALF_OPEN transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Invoke `op` unless the breaker is open.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: BreakerFailure,
    {
        let _probe = self.try_acquire()?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if err.trips_breaker() {
                    self.record_failure();
                }
                Err(CircuitError::Inner(err))
            }
        }
    }

    fn try_acquire<E>(&self) -> Result<Option<ProbeSlot<'_>>, CircuitError<E>> {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => return Ok(None),
            CircuitState::HalfOpen => {
                if inner.in_flight_probes < self.config.success_threshold {
                    inner.in_flight_probes += 1;
                    return Ok(Some(ProbeSlot {
                        breaker: self,
                        round: inner.probe_round,
                    }));
                }
                counter!("circuit_breaker_probes_rejected_total").increment(1);
                return Err(CircuitError::Open {
                    name: self.name.clone(),
                    retry_in: Duration::ZERO,
                });
            }
            CircuitState::Open => {}
        }

        let elapsed = inner
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or_default();
        Err(CircuitError::Open {
            name: self.name.clone(),
            retry_in: self.config.recovery_timeout().saturating_sub(elapsed),
        })
    }

    fn maybe_half_open(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let recovered = inner
            .last_failure
            .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout());
        if recovered {
            info!(breaker = %self.name, "Circuit half-open, probing");
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.in_flight_probes = 0;
            inner.probe_round += 1;
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!(breaker = %self.name, "Circuit closed");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.in_flight_probes = 0;
                    inner.last_failure = None;
                }
            }
            // A call admitted before another caller tripped the breaker.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                self.open(&mut inner);
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                inner.in_flight_probes = 0;
                self.open(&mut inner);
            }
            _ => {}
        }
    }

    fn open(&self, inner: &mut BreakerState) {
        warn!(
            breaker = %self.name,
            failures = inner.failure_count,
            recovery_timeout_secs = self.config.recovery_timeout_seconds,
            "Circuit opened"
        );
        inner.state = CircuitState::Open;
        counter!("circuit_breaker_opened_total").increment(1);
    }
}

/// Process-wide breakers keyed by normalised instance URL.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_instance(&self, url: &str) -> Arc<CircuitBreaker> {
        let key = normalize_instance_url(url);
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
            .clone()
    }

    /// `(instance, state)` for every breaker created so far.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        let mut states: Vec<_> = breakers
            .iter()
            .map(|b| (b.name().to_string(), b.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

fn normalize_instance_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_lowercase()
}
