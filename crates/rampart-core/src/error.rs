//! Structured errors produced by every resilience primitive.
//!
//! All kinds share one immutable [`ResilienceError`] carrying the common
//! envelope (`code`, `service`, `message`, `correlation_id`, `timestamp`,
//! optional `cause`) plus kind-specific [`ErrorDetails`]. Transport layers
//! map errors to their own status codes by inspecting [`ResilienceError::code`].

use crate::config::duration::millis;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shared, cloneable error handle.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Machine-readable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    CircuitOpen,
    RateLimited,
    Timeout,
    BulkheadFull,
    RetryExhausted,
    InvalidPolicy,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::BulkheadFull => "BULKHEAD_FULL",
            ErrorCode::RetryExhausted => "RETRY_EXHAUSTED",
            ErrorCode::InvalidPolicy => "INVALID_POLICY",
        }
    }

    /// Admission rejections are never retried by the engine.
    pub fn is_rejection(self) -> bool {
        matches!(
            self,
            ErrorCode::CircuitOpen | ErrorCode::RateLimited | ErrorCode::BulkheadFull
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific fields.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorDetails {
    CircuitOpen {
        opened_at: DateTime<Utc>,
        #[serde(rename = "reset_after_ms", with = "millis")]
        reset_after: Duration,
        failure_rate: f64,
    },
    RateLimited {
        limit: u32,
        #[serde(rename = "window_ms", with = "millis")]
        window: Duration,
        #[serde(rename = "retry_after_ms", with = "millis")]
        retry_after: Duration,
    },
    Timeout {
        #[serde(rename = "timeout_ms", with = "millis")]
        timeout: Duration,
        #[serde(rename = "elapsed_ms", with = "millis")]
        elapsed: Duration,
    },
    BulkheadFull {
        max_concurrent: u32,
        queue_size: u32,
        current_load: u32,
    },
    RetryExhausted {
        attempts: u32,
        #[serde(rename = "total_time_ms", with = "millis")]
        total_time: Duration,
        #[serde(serialize_with = "serialize_errors")]
        errors: Vec<SharedError>,
    },
    InvalidPolicy {
        field: String,
        value: String,
        expected: String,
    },
}

/// A typed resilience failure.
#[derive(Debug, Clone, Error, Serialize)]
#[error("[{code}] {service}: {message}{}", caused_by(.cause))]
pub struct ResilienceError {
    code: ErrorCode,
    service: String,
    message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    correlation_id: String,
    timestamp: DateTime<Utc>,
    #[source]
    #[serde(serialize_with = "serialize_cause", skip_serializing_if = "Option::is_none")]
    cause: Option<SharedError>,
    details: ErrorDetails,
}

fn caused_by(cause: &Option<SharedError>) -> String {
    match cause {
        Some(cause) => format!(" (caused by: {cause})"),
        None => String::new(),
    }
}

fn serialize_cause<S>(cause: &Option<SharedError>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match cause {
        Some(cause) => serializer.serialize_str(&cause.to_string()),
        None => serializer.serialize_none(),
    }
}

fn serialize_errors<S>(errors: &[SharedError], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(errors.iter().map(|e| e.to_string()))
}

impl ResilienceError {
    fn new(
        code: ErrorCode,
        service: impl Into<String>,
        message: impl Into<String>,
        details: ErrorDetails,
    ) -> Self {
        Self {
            code,
            service: service.into(),
            message: message.into(),
            correlation_id: String::new(),
            timestamp: Utc::now(),
            cause: None,
            details,
        }
    }

    /// Admission refused while the breaker is open.
    pub fn circuit_open(
        service: impl Into<String>,
        opened_at: DateTime<Utc>,
        reset_after: Duration,
        failure_rate: f64,
    ) -> Self {
        Self::new(
            ErrorCode::CircuitOpen,
            service,
            "circuit breaker is open",
            ErrorDetails::CircuitOpen {
                opened_at,
                reset_after,
                failure_rate,
            },
        )
    }

    /// Admission refused by the token bucket.
    pub fn rate_limited(
        service: impl Into<String>,
        limit: u32,
        window: Duration,
        retry_after: Duration,
    ) -> Self {
        Self::new(
            ErrorCode::RateLimited,
            service,
            "rate limit exceeded",
            ErrorDetails::RateLimited {
                limit,
                window,
                retry_after,
            },
        )
    }

    /// An enclosing timeout elapsed.
    pub fn timeout(service: impl Into<String>, timeout: Duration, elapsed: Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            service,
            "operation timed out",
            ErrorDetails::Timeout { timeout, elapsed },
        )
    }

    /// Concurrency and queue capacity both exhausted.
    pub fn bulkhead_full(
        service: impl Into<String>,
        max_concurrent: u32,
        queue_size: u32,
        current_load: u32,
    ) -> Self {
        Self::new(
            ErrorCode::BulkheadFull,
            service,
            "bulkhead capacity exceeded",
            ErrorDetails::BulkheadFull {
                max_concurrent,
                queue_size,
                current_load,
            },
        )
    }

    /// Every attempt failed. The last error becomes the cause.
    pub fn retry_exhausted(
        service: impl Into<String>,
        attempts: u32,
        total_time: Duration,
        errors: Vec<SharedError>,
    ) -> Self {
        let cause = errors.last().cloned();
        let mut err = Self::new(
            ErrorCode::RetryExhausted,
            service,
            "all retry attempts exhausted",
            ErrorDetails::RetryExhausted {
                attempts,
                total_time,
                errors,
            },
        );
        err.cause = cause;
        err
    }

    /// Configuration failed validation.
    pub fn invalid_policy(
        service: impl Into<String>,
        field: impl Into<String>,
        value: impl ToString,
        expected: impl Into<String>,
    ) -> Self {
        let field = field.into();
        Self::new(
            ErrorCode::InvalidPolicy,
            service,
            format!("invalid policy: {field}"),
            ErrorDetails::InvalidPolicy {
                field,
                value: value.to_string(),
                expected: expected.into(),
            },
        )
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_cause(mut self, cause: SharedError) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn cause(&self) -> Option<&SharedError> {
        self.cause.as_ref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Suggested wait before trying again, for rejections that carry one.
    pub fn retry_after(&self) -> Option<Duration> {
        match &self.details {
            ErrorDetails::RateLimited { retry_after, .. } => Some(*retry_after),
            ErrorDetails::CircuitOpen { reset_after, .. } => Some(*reset_after),
            _ => None,
        }
    }

    /// Ordered errors of a `RETRY_EXHAUSTED` failure; empty for other kinds.
    pub fn attempt_errors(&self) -> &[SharedError] {
        match &self.details {
            ErrorDetails::RetryExhausted { errors, .. } => errors,
            _ => &[],
        }
    }

    /// Render as JSON for logs or transport bodies.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
