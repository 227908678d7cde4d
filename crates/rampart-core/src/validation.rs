//! Synchronous bounds checking for configuration.
//!
//! Checks run in a fixed order and stop at the first violation, which is
//! reported as an `INVALID_POLICY` error naming the dotted field path.

use crate::config::{
    BulkheadConfig, CircuitBreakerConfig, RateLimitConfig, RetryConfig, TimeoutConfig,
};
use crate::error::ResilienceError;
use crate::policy::Policy;
use std::time::Duration;

const POSITIVE_INTEGER: &str = "positive integer";
const POSITIVE_DURATION: &str = "positive duration";

/// Configuration that can be checked before use.
pub trait Validate {
    fn validate(&self) -> Result<(), ResilienceError>;
}

fn render(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

fn positive(section: &str, field: &str, value: u32) -> Result<(), ResilienceError> {
    if value == 0 {
        return Err(ResilienceError::invalid_policy(
            section,
            format!("{section}.{field}"),
            value,
            POSITIVE_INTEGER,
        ));
    }
    Ok(())
}

fn positive_duration(section: &str, field: &str, value: Duration) -> Result<(), ResilienceError> {
    if value.is_zero() {
        return Err(ResilienceError::invalid_policy(
            section,
            format!("{section}.{field}"),
            render(value),
            POSITIVE_DURATION,
        ));
    }
    Ok(())
}

impl Validate for CircuitBreakerConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        positive("circuit_breaker", "failure_threshold", self.failure_threshold)?;
        positive("circuit_breaker", "success_threshold", self.success_threshold)?;
        positive_duration("circuit_breaker", "timeout", self.timeout)?;
        positive("circuit_breaker", "half_open_requests", self.half_open_requests)
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        positive("retry", "max_attempts", self.max_attempts)?;
        positive_duration("retry", "initial_interval", self.initial_interval)?;
        if self.max_interval < self.initial_interval {
            return Err(ResilienceError::invalid_policy(
                "retry",
                "retry.max_interval",
                render(self.max_interval),
                "greater than or equal to retry.initial_interval",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ResilienceError::invalid_policy(
                "retry",
                "retry.multiplier",
                self.multiplier,
                "at least 1.0",
            ));
        }
        Ok(())
    }
}

impl Validate for RateLimitConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        positive("rate_limit", "rate", self.rate)?;
        positive_duration("rate_limit", "window", self.window)
    }
}

impl Validate for BulkheadConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        positive("bulkhead", "max_concurrent", self.max_concurrent)
    }
}

impl Validate for TimeoutConfig {
    fn validate(&self) -> Result<(), ResilienceError> {
        positive_duration("timeout", "timeout", self.timeout)
    }
}

impl Validate for Policy {
    fn validate(&self) -> Result<(), ResilienceError> {
        if self.name.trim().is_empty() {
            return Err(ResilienceError::invalid_policy(
                "policy",
                "name",
                format!("{:?}", self.name),
                "non-empty name",
            ));
        }
        if self.is_empty() {
            return Err(ResilienceError::invalid_policy(
                &self.name,
                "policy",
                "no sub-configs",
                "at least one of circuit_breaker, retry, rate_limit, bulkhead or timeout",
            ));
        }

        let sections: [Option<&dyn Validate>; 5] = [
            self.circuit_breaker.as_ref().map(|c| c as &dyn Validate),
            self.retry.as_ref().map(|c| c as &dyn Validate),
            self.rate_limit.as_ref().map(|c| c as &dyn Validate),
            self.bulkhead.as_ref().map(|c| c as &dyn Validate),
            self.timeout.as_ref().map(|c| c as &dyn Validate),
        ];
        for section in sections.into_iter().flatten() {
            section
                .validate()
                .map_err(|err| err.with_service(self.name.clone()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, ErrorDetails};
    use proptest::prelude::*;

    fn field_of(err: &ResilienceError) -> &str {
        match err.details() {
            ErrorDetails::InvalidPolicy { field, .. } => field,
            other => panic!("unexpected details: {other:?}"),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RateLimitConfig::default().validate().is_ok());
        assert!(BulkheadConfig::default().validate().is_ok());
        assert!(TimeoutConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_policy_rejected() {
        let err = Policy::new("orders").validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPolicy);
        assert_eq!(field_of(&err), "policy");
        assert_eq!(err.service(), "orders");
    }

    #[test]
    fn test_blank_name_rejected() {
        let policy = Policy::new("  ").with_timeout(TimeoutConfig::default());
        let err = policy.validate().unwrap_err();
        assert_eq!(field_of(&err), "name");
    }

    #[test]
    fn test_fails_fast_in_section_order() {
        let policy = Policy::new("orders")
            .with_circuit_breaker(CircuitBreakerConfig::default().with_success_threshold(0))
            .with_retry(RetryConfig::default().with_multiplier(0.5));

        let err = policy.validate().unwrap_err();
        assert_eq!(field_of(&err), "circuit_breaker.success_threshold");
        assert_eq!(err.service(), "orders");
    }

    #[test]
    fn test_max_interval_below_initial() {
        let config = RetryConfig::default()
            .with_initial_interval(Duration::from_secs(2))
            .with_max_interval(Duration::from_secs(1));
        let err = config.validate().unwrap_err();
        assert_eq!(field_of(&err), "retry.max_interval");
        match err.details() {
            ErrorDetails::InvalidPolicy { value, expected, .. } => {
                assert_eq!(value, "1s");
                assert_eq!(expected, "greater than or equal to retry.initial_interval");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_nan_multiplier_rejected() {
        let config = RetryConfig::default().with_multiplier(f64::NAN);
        assert_eq!(field_of(&config.validate().unwrap_err()), "retry.multiplier");
    }

    #[test]
    fn test_zero_durations_rejected() {
        let cb = CircuitBreakerConfig::default().with_timeout(Duration::ZERO);
        assert_eq!(field_of(&cb.validate().unwrap_err()), "circuit_breaker.timeout");

        let rl = RateLimitConfig::new(10, Duration::ZERO);
        assert_eq!(field_of(&rl.validate().unwrap_err()), "rate_limit.window");

        let timeout = TimeoutConfig::new(Duration::ZERO);
        assert_eq!(field_of(&timeout.validate().unwrap_err()), "timeout.timeout");
    }

    #[test]
    fn test_bulkhead_without_queue_is_valid() {
        assert!(BulkheadConfig::new(1).validate().is_ok());
        let err = BulkheadConfig::new(0).validate().unwrap_err();
        assert_eq!(field_of(&err), "bulkhead.max_concurrent");
    }

    proptest! {
        #[test]
        fn prop_multiplier_below_one_rejected(multiplier in 0.0f64..1.0) {
            let policy = Policy::new("p").with_retry(RetryConfig::default().with_multiplier(multiplier));
            let err = policy.validate().unwrap_err();
            prop_assert_eq!(err.code(), ErrorCode::InvalidPolicy);
            prop_assert_eq!(field_of(&err), "retry.multiplier");
        }

        #[test]
        fn prop_interval_ordering(initial_ms in 1u64..10_000, max_ms in 0u64..10_000) {
            let config = RetryConfig::default()
                .with_initial_interval(Duration::from_millis(initial_ms))
                .with_max_interval(Duration::from_millis(max_ms));
            prop_assert_eq!(config.validate().is_ok(), max_ms >= initial_ms);
        }

        #[test]
        fn prop_zero_threshold_rejected(success in 1u32..100, probes in 1u32..10) {
            let config = CircuitBreakerConfig::default()
                .with_failure_threshold(0)
                .with_success_threshold(success)
                .with_half_open_requests(probes);
            let err = config.validate().unwrap_err();
            prop_assert_eq!(field_of(&err), "circuit_breaker.failure_threshold");
        }
    }
}
