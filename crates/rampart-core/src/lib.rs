//! # rampart-core
//!
//! Configuration, validation and error taxonomy for the Rampart
//! resilience engine.
//!
//! This crate is synchronous and has no runtime dependency. It defines:
//! - Typed configuration records for circuit breakers, retries, token-bucket
//!   rate limits, bulkheads and timeouts
//! - [`Policy`], a named bundle of those records
//! - [`Validate`], fail-fast bounds checking
//! - [`ResilienceError`], the structured error every primitive returns
//!
//! The async primitives and the policy registry live in `rampart-runtime`.
//!
//! ## Example
//!
//! ```rust
//! use rampart_core::{CircuitBreakerConfig, Policy, RetryConfig, Validate};
//! use std::time::Duration;
//!
//! let policy = Policy::new("vault")
//!     .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(3))
//!     .with_retry(RetryConfig::default().with_max_interval(Duration::from_secs(2)));
//!
//! assert!(policy.validate().is_ok());
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod validation;

pub use config::{
    BulkheadConfig, CircuitBreakerConfig, CircuitState, JitterStrategy, RateLimitConfig,
    RetryConfig, RetryPredicate, StateChangeObserver, TimeoutConfig,
};
pub use error::{ErrorCode, ErrorDetails, ResilienceError, SharedError};
pub use metrics::ExecutionMetrics;
pub use policy::Policy;
pub use validation::Validate;
