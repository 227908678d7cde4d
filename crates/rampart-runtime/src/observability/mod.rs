//! Telemetry emitted by policy executions.
//!
//! The registry reports through a [`MetricsRecorder`]; how the signals are
//! exported is up to the implementation. Provided recorders:
//! - [`NoopRecorder`] discards everything
//! - [`TracingRecorder`] emits structured `tracing` events
//! - [`MetricsFacadeRecorder`] feeds the `metrics` crate facade
//! - [`InMemoryRecorder`] keeps every signal for inspection

mod facade;

pub use facade::MetricsFacadeRecorder;

use parking_lot::Mutex;
use rampart_core::{CircuitState, ExecutionMetrics};

/// Sink for execution telemetry. Calls must not block.
pub trait MetricsRecorder: Send + Sync {
    fn record_execution(&self, metrics: &ExecutionMetrics);

    fn record_circuit_state(&self, policy: &str, state: CircuitState);

    fn record_retry_attempt(&self, policy: &str, attempt: u32);

    fn record_rate_limit(&self, policy: &str, limited: bool);

    fn record_bulkhead_queue(&self, policy: &str, queued: bool);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn record_execution(&self, _metrics: &ExecutionMetrics) {}

    fn record_circuit_state(&self, _policy: &str, _state: CircuitState) {}

    fn record_retry_attempt(&self, _policy: &str, _attempt: u32) {}

    fn record_rate_limit(&self, _policy: &str, _limited: bool) {}

    fn record_bulkhead_queue(&self, _policy: &str, _queued: bool) {}
}

/// Logs every signal as a structured event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl MetricsRecorder for TracingRecorder {
    fn record_execution(&self, metrics: &ExecutionMetrics) {
        tracing::info!(
            policy = %metrics.policy_name,
            duration_ms = metrics.duration.as_millis() as u64,
            success = metrics.success,
            retry_attempts = metrics.retry_attempts,
            rate_limited = metrics.rate_limited,
            bulkhead_queued = metrics.bulkhead_queued,
            circuit_state = ?metrics.circuit_state,
            error_code = ?metrics.error_code,
            "Policy execution completed"
        );
    }

    fn record_circuit_state(&self, policy: &str, state: CircuitState) {
        tracing::info!(policy, state = %state, "Circuit state changed");
    }

    fn record_retry_attempt(&self, policy: &str, attempt: u32) {
        tracing::debug!(policy, attempt, "Retry attempt");
    }

    fn record_rate_limit(&self, policy: &str, limited: bool) {
        if limited {
            tracing::warn!(policy, "Rate limit hit");
        }
    }

    fn record_bulkhead_queue(&self, policy: &str, queued: bool) {
        if queued {
            tracing::debug!(policy, "Bulkhead call queued");
        }
    }
}

/// A signal captured by [`InMemoryRecorder`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedSignal {
    Execution(ExecutionMetrics),
    CircuitState { policy: String, state: CircuitState },
    RetryAttempt { policy: String, attempt: u32 },
    RateLimit { policy: String, limited: bool },
    BulkheadQueue { policy: String, queued: bool },
}

/// Keeps signals in memory, in arrival order.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    signals: Mutex<Vec<RecordedSignal>>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<RecordedSignal> {
        self.signals.lock().clone()
    }

    pub fn executions(&self) -> Vec<ExecutionMetrics> {
        self.signals
            .lock()
            .iter()
            .filter_map(|signal| match signal {
                RecordedSignal::Execution(metrics) => Some(metrics.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn circuit_states(&self, policy: &str) -> Vec<CircuitState> {
        self.signals
            .lock()
            .iter()
            .filter_map(|signal| match signal {
                RecordedSignal::CircuitState { policy: p, state } if p == policy => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.signals.lock().clear();
    }

    fn push(&self, signal: RecordedSignal) {
        self.signals.lock().push(signal);
    }
}

impl MetricsRecorder for InMemoryRecorder {
    fn record_execution(&self, metrics: &ExecutionMetrics) {
        self.push(RecordedSignal::Execution(metrics.clone()));
    }

    fn record_circuit_state(&self, policy: &str, state: CircuitState) {
        self.push(RecordedSignal::CircuitState {
            policy: policy.to_string(),
            state,
        });
    }

    fn record_retry_attempt(&self, policy: &str, attempt: u32) {
        self.push(RecordedSignal::RetryAttempt {
            policy: policy.to_string(),
            attempt,
        });
    }

    fn record_rate_limit(&self, policy: &str, limited: bool) {
        self.push(RecordedSignal::RateLimit {
            policy: policy.to_string(),
            limited,
        });
    }

    fn record_bulkhead_queue(&self, policy: &str, queued: bool) {
        self.push(RecordedSignal::BulkheadQueue {
            policy: policy.to_string(),
            queued,
        });
    }
}
