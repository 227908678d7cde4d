use crate::config::CircuitState;
use serde::Serialize;
use std::time::Duration;

/// Outcome of one policy execution, emitted once per call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionMetrics {
    pub policy_name: String,

    #[serde(rename = "duration_ms", with = "crate::config::duration::millis")]
    pub duration: Duration,

    pub success: bool,

    /// Retries scheduled after the first attempt
    pub retry_attempts: u32,

    pub rate_limited: bool,

    pub bulkhead_queued: bool,

    /// Breaker state after the call, when the policy has a breaker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<CircuitState>,

    /// Error code when the call failed with a resilience error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<crate::error::ErrorCode>,
}

impl ExecutionMetrics {
    pub fn new(policy_name: impl Into<String>) -> Self {
        Self {
            policy_name: policy_name.into(),
            duration: Duration::ZERO,
            success: false,
            retry_attempts: 0,
            rate_limited: false,
            bulkhead_queued: false,
            circuit_state: None,
            error_code: None,
        }
    }
}
