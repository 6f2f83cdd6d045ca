//! Circuit breaker pattern for resilient backend communication
//!
//! Prevents cascade failures by temporarily excluding failing backends from
//! selection. One breaker exists per backend for the lifetime of the process.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use validator::Validate;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Failure threshold reached - requests are rejected
    Open,
    /// Testing if the backend has recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    /// Trial successes in half-open state needed to close the circuit
    #[validate(range(min = 1))]
    pub success_threshold: u32,
    /// Time an open circuit waits before admitting trials
    pub timeout_ms: u64,
    /// Trials admitted while half-open
    #[validate(range(min = 1))]
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 60_000,
            half_open_max_requests: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Snapshot of one backend's breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStatus {
    pub backend_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    trials_admitted: u32,
    opened_at: Option<Instant>,
    /// Start of the current half-open trial window
    trials_since: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt_time: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            trials_admitted: 0,
            opened_at: None,
            trials_since: None,
            last_failure_time: None,
            next_attempt_time: None,
        }
    }
}

/// Circuit breaker for a single backend
pub struct CircuitBreaker {
    backend_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(backend_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            backend_id: backend_id.into(),
            config,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether the backend may be selected right now.
    ///
    /// An open circuit whose timeout has elapsed moves to half-open here.
    /// Half-open circuits are available while trial slots remain; once a
    /// trial window has lasted `timeout` without settling, its slots are
    /// handed out again.
    pub fn is_available(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.timeout())
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.trials_admitted = 0;
                    inner.trials_since = Some(Instant::now());
                    info!("Circuit breaker '{}' transitioned to half-open", self.backend_id);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trials_admitted < self.config.half_open_max_requests {
                    return true;
                }
                let stale = inner
                    .trials_since
                    .map(|at| at.elapsed() >= self.config.timeout())
                    .unwrap_or(true);
                if stale {
                    debug!(
                        "Circuit breaker '{}' re-arming {} unsettled trials",
                        self.backend_id, inner.trials_admitted
                    );
                    inner.trials_admitted = 0;
                    inner.trials_since = Some(Instant::now());
                }
                stale
            }
        }
    }

    /// Note that a request is being sent to this backend.
    pub fn on_dispatch(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trials_admitted += 1;
        }
    }

    /// Give back a trial slot taken by `on_dispatch` for a call that was
    /// never sent.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trials_admitted = inner.trials_admitted.saturating_sub(1);
        }
    }

    /// Availability check plus dispatch bookkeeping in one step
    pub fn allow_request(&self) -> bool {
        if self.is_available() {
            self.on_dispatch();
            true
        } else {
            false
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    *inner = BreakerState::closed();
                    info!("Circuit breaker '{}' closed after recovery", self.backend_id);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        inner.last_failure_time = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.open(&mut inner, now);
                    warn!(
                        "Circuit breaker '{}' opened after {} failures",
                        self.backend_id, inner.failure_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                self.open(&mut inner, now);
                warn!(
                    "Circuit breaker '{}' re-opened after failure in half-open state",
                    self.backend_id
                );
            }
            CircuitState::Open => {
                inner.failure_count += 1;
            }
        }
    }

    fn open(&self, inner: &mut BreakerState, now: DateTime<Utc>) {
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        inner.trials_admitted = 0;
        inner.trials_since = None;
        inner.opened_at = Some(Instant::now());
        inner.next_attempt_time = chrono::Duration::from_std(self.config.timeout())
            .ok()
            .map(|timeout| now + timeout);
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock();
        CircuitBreakerStatus {
            backend_id: self.backend_id.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
            next_attempt_time: match inner.state {
                CircuitState::Open => inner.next_attempt_time,
                _ => None,
            },
        }
    }

    /// Reset the circuit breaker (for manual intervention)
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::closed();
        info!("Circuit breaker '{}' manually reset", self.backend_id);
    }
}

/// One breaker per backend, created on first use
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Get or create the breaker for a backend
    pub fn breaker(&self, backend_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(backend_id, self.config.clone())))
            .clone()
    }

    /// Breaker for a backend only if one has been created
    pub fn existing(&self, backend_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(backend_id).map(|b| b.clone())
    }

    pub fn all_statuses(&self) -> Vec<CircuitBreakerStatus> {
        let mut statuses: Vec<_> = self.breakers.iter().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        statuses
    }

    pub fn reset(&self, backend_id: &str) {
        if let Some(breaker) = self.breakers.get(backend_id) {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
