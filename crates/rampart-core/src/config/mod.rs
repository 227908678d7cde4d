//! Typed configuration records for each resilience primitive.
//!
//! Every record has a `Default` carrying production defaults, `with_*`
//! builders, and a serde representation with human-readable durations.
//! Bounds are enforced by [`crate::Validate`], not by construction.

mod bulkhead;
mod circuit_breaker;
pub(crate) mod duration;
mod rate_limit;
mod retry;
mod timeout;

pub use bulkhead::BulkheadConfig;
pub use circuit_breaker::{CircuitBreakerConfig, CircuitState, StateChangeObserver};
pub use rate_limit::RateLimitConfig;
pub use retry::{JitterStrategy, RetryConfig, RetryPredicate};
pub use timeout::TimeoutConfig;
