//! Bounded re-invocation with exponential backoff and jitter.

use super::{race_context, OperationResult};
use crate::context::Context;
use crate::error::{BoxError, ExecutionError};
use rampart_core::{JitterStrategy, ResilienceError, RetryConfig, SharedError};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A retry about to be scheduled.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    /// Number of the upcoming attempt (1 for the first retry)
    pub attempt: u32,
    pub delay: Duration,
    pub error: ExecutionError,
}

type RetryListener = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Re-invokes failing operations according to a [`RetryConfig`].
pub struct RetryExecutor {
    name: String,
    config: RetryConfig,
    listener: Option<RetryListener>,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            listener: None,
        }
    }

    /// Be told about every retry before its backoff sleep.
    pub fn with_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.listener = Some(Arc::new(listener));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Capped delay before jitter: `min(initial * multiplier^attempt, max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let cap = self.config.max_interval;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos =
            self.config.initial_interval.as_nanos() as f64 * self.config.multiplier.powi(exponent);

        if !nanos.is_finite() || nanos >= cap.as_nanos() as f64 {
            return cap;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    /// Delay to sleep after the given zero-based attempt fails.
    pub fn delay(&self, attempt: u32) -> Duration {
        apply_jitter(self.config.jitter, self.base_delay(attempt), &mut rand::thread_rng())
    }

    /// Whether `err` may be retried. Admission rejections and caller
    /// cancellation never are.
    pub fn is_retryable(&self, err: &ExecutionError) -> bool {
        match err {
            ExecutionError::PolicyNotFound(_)
            | ExecutionError::Cancelled
            | ExecutionError::DeadlineExceeded => false,
            err if err.is_rejection() => false,
            err => self.config.should_retry(err.as_predicate_input()),
        }
    }

    pub async fn execute<F, Fut, E>(&self, ctx: &Context, op: F) -> Result<(), ExecutionError>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<BoxError>,
    {
        self.execute_with_result(ctx, op).await
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// attempts run out.
    pub async fn execute_with_result<F, Fut, T, E>(
        &self,
        ctx: &Context,
        mut op: F,
    ) -> Result<T, ExecutionError>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);
        let mut errors: Vec<SharedError> = Vec::new();

        for attempt in 0..max_attempts {
            ctx.check()?;

            let result: OperationResult<T> = race_context(ctx, op(ctx.clone())).await;
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !self.is_retryable(&err) {
                return Err(err);
            }
            errors.push(err.clone().into_shared());

            if attempt + 1 < max_attempts {
                let delay = self.delay(attempt);
                tracing::debug!(
                    retry = %self.name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Scheduling retry"
                );
                if let Some(listener) = &self.listener {
                    listener(&RetryEvent {
                        attempt: attempt + 1,
                        delay,
                        error: err,
                    });
                }

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    reason = ctx.done() => return Err(reason),
                }
            }
        }

        tracing::warn!(
            retry = %self.name,
            attempts = max_attempts,
            "All retry attempts exhausted"
        );
        Err(ResilienceError::retry_exhausted(
            &self.name,
            max_attempts,
            started.elapsed(),
            errors,
        )
        .with_correlation_id(ctx.correlation_id())
        .into())
    }
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Randomize a capped delay.
pub fn apply_jitter<R: Rng>(strategy: JitterStrategy, delay: Duration, rng: &mut R) -> Duration {
    let span = nanos(delay);
    if span == 0 {
        return delay;
    }

    match strategy {
        JitterStrategy::None => delay,
        JitterStrategy::Full => Duration::from_nanos(rng.gen_range(0..span)),
        JitterStrategy::Equal => {
            let half = span / 2;
            let extra = if half == 0 { 0 } else { rng.gen_range(0..half) };
            Duration::from_nanos(half + extra)
        }
        JitterStrategy::Decorrelated => {
            Duration::from_nanos(span.saturating_add(rng.gen_range(0..span)))
        }
    }
}
