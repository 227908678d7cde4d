use super::MetricsRecorder;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use rampart_core::{CircuitState, ExecutionMetrics};

/// Publishes signals through the `metrics` facade, labelled by policy.
///
/// Pair with any exporter installed as the global recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsFacadeRecorder;

impl MetricsFacadeRecorder {
    /// Create the recorder and register metric descriptions.
    pub fn new() -> Self {
        describe_counter!(
            "rampart_executions_total",
            Unit::Count,
            "Policy executions by outcome"
        );
        describe_histogram!(
            "rampart_execution_duration_seconds",
            Unit::Seconds,
            "Wall time of a policy execution"
        );
        describe_counter!(
            "rampart_retry_attempts_total",
            Unit::Count,
            "Retries scheduled by retry executors"
        );
        describe_gauge!(
            "rampart_circuit_state",
            "Circuit state (0 closed, 1 half-open, 2 open)"
        );
        describe_counter!(
            "rampart_rate_limited_total",
            Unit::Count,
            "Calls rejected or delayed by a rate limiter"
        );
        describe_counter!(
            "rampart_bulkhead_queued_total",
            Unit::Count,
            "Calls that waited for a bulkhead slot"
        );
        Self
    }
}

impl MetricsRecorder for MetricsFacadeRecorder {
    fn record_execution(&self, metrics: &ExecutionMetrics) {
        let outcome = if metrics.success { "success" } else { "failure" };
        counter!(
            "rampart_executions_total",
            "policy" => metrics.policy_name.clone(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!(
            "rampart_execution_duration_seconds",
            "policy" => metrics.policy_name.clone()
        )
        .record(metrics.duration.as_secs_f64());
    }

    fn record_circuit_state(&self, policy: &str, state: CircuitState) {
        gauge!("rampart_circuit_state", "policy" => policy.to_string()).set(state.as_gauge());
    }

    fn record_retry_attempt(&self, policy: &str, _attempt: u32) {
        counter!("rampart_retry_attempts_total", "policy" => policy.to_string()).increment(1);
    }

    fn record_rate_limit(&self, policy: &str, limited: bool) {
        if limited {
            counter!("rampart_rate_limited_total", "policy" => policy.to_string()).increment(1);
        }
    }

    fn record_bulkhead_queue(&self, policy: &str, queued: bool) {
        if queued {
            counter!("rampart_bulkhead_queued_total", "policy" => policy.to_string())
                .increment(1);
        }
    }
}
