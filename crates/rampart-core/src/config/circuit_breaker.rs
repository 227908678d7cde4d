use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,

    /// Calls are rejected until the open timeout elapses
    Open,

    /// Probing whether the dependency recovered
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by gauges (0 closed, 1 half-open, 2 open).
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives circuit transitions.
///
/// Called off the admission path; implementations must not assume they run
/// on the caller's task. Any `Fn(CircuitState, CircuitState)` closure works.
pub trait StateChangeObserver: Send + Sync {
    fn on_state_change(&self, from: CircuitState, to: CircuitState);
}

impl<F> StateChangeObserver for F
where
    F: Fn(CircuitState, CircuitState) + Send + Sync,
{
    fn on_state_change(&self, from: CircuitState, to: CircuitState) {
        self(from, to)
    }
}

/// Circuit breaker configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before opening
    pub failure_threshold: u32,

    /// Successes in HalfOpen before closing
    pub success_threshold: u32,

    /// Time spent Open before a probe is admitted
    #[serde(with = "super::duration")]
    pub timeout: Duration,

    /// Concurrent probes admitted while HalfOpen
    pub half_open_requests: u32,

    /// Optional transition observer
    #[serde(skip)]
    pub on_state_change: Option<Arc<dyn StateChangeObserver>>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_requests: 1,
            on_state_change: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_half_open_requests(mut self, requests: u32) -> Self {
        self.half_open_requests = requests;
        self
    }

    /// Register an observer for state transitions.
    pub fn with_observer(mut self, observer: impl StateChangeObserver + 'static) -> Self {
        self.on_state_change = Some(Arc::new(observer));
        self
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("timeout", &self.timeout)
            .field("half_open_requests", &self.half_open_requests)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}
