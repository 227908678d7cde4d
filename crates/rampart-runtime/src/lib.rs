//! # rampart-runtime
//!
//! Async resilience primitives and the policy registry for Rampart.
//!
//! Services register named [`Policy`] bundles once at startup and run every
//! call to a dependency through them:
//!
//! ```rust,no_run
//! use rampart_runtime::{CircuitBreakerConfig, Context, Policy, PolicyRegistry, RetryConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = PolicyRegistry::new();
//! registry.register_policy(
//!     Policy::new("vault")
//!         .with_circuit_breaker(CircuitBreakerConfig::default())
//!         .with_retry(RetryConfig::default()),
//! )?;
//!
//! let secret = registry
//!     .execute_with_result(&Context::new(), "vault", |_ctx| async {
//!         Ok::<_, std::io::Error>("s3cr3t".to_string())
//!     })
//!     .await?;
//! # let _ = secret;
//! # Ok(())
//! # }
//! ```
//!
//! Each primitive ([`CircuitBreaker`], [`RetryExecutor`], [`RateLimiter`],
//! [`Bulkhead`], [`Timeout`]) can also be used directly.

pub mod context;
pub mod error;
pub mod observability;
pub mod registry;
pub mod resilience;

pub use context::Context;
pub use error::{BoxError, ExecutionError};
pub use observability::{
    InMemoryRecorder, MetricsFacadeRecorder, MetricsRecorder, NoopRecorder, RecordedSignal,
    TracingRecorder,
};
pub use registry::{PolicyChain, PolicyRegistry};
pub use resilience::{
    Bulkhead, BulkheadMetrics, BulkheadPermit, CircuitBreaker, CircuitPermit, CircuitSnapshot,
    RateLimitDecision, RateLimitHeaders, RateLimiter, RetryEvent, RetryExecutor, Timeout,
};

pub use rampart_core::{
    BulkheadConfig, CircuitBreakerConfig, CircuitState, ErrorCode, ErrorDetails,
    ExecutionMetrics, JitterStrategy, Policy, RateLimitConfig, ResilienceError, RetryConfig,
    TimeoutConfig, Validate,
};
