//! Resilience primitives.
//!
//! This module provides:
//! - Circuit breaker to stop calling failing dependencies
//! - Retry with exponential backoff and jitter
//! - Token-bucket rate limiting
//! - Concurrency bulkhead
//! - Per-attempt timeout
//!
//! Each primitive is usable on its own; [`crate::PolicyRegistry`] composes
//! them into named policies.

mod bulkhead;
mod circuit_breaker;
mod rate_limiter;
mod retry;
mod timeout;

pub use bulkhead::{Bulkhead, BulkheadMetrics, BulkheadPermit};
pub use circuit_breaker::{CircuitBreaker, CircuitPermit, CircuitSnapshot};
pub use rate_limiter::{RateLimitDecision, RateLimitHeaders, RateLimiter};
pub use retry::{apply_jitter, RetryEvent, RetryExecutor};
pub use timeout::Timeout;

use crate::context::Context;
use crate::error::{BoxError, ExecutionError};
use std::future::Future;

pub(crate) type OperationResult<T> = Result<T, ExecutionError>;

/// Drive `fut` unless the context finishes first.
pub(crate) async fn race_context<Fut, T, E>(ctx: &Context, fut: Fut) -> OperationResult<T>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    tokio::select! {
        biased;
        result = fut => result.map_err(|err| ExecutionError::from_boxed(err.into())),
        reason = ctx.done() => Err(reason),
    }
}
