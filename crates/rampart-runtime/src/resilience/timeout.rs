//! Per-attempt time limit.

use crate::context::Context;
use crate::error::{BoxError, ExecutionError};
use rampart_core::{ResilienceError, TimeoutConfig};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Bounds a single operation attempt; expiry drops the attempt.
#[derive(Debug, Clone)]
pub struct Timeout {
    name: String,
    config: TimeoutConfig,
}

impl Timeout {
    pub fn new(name: impl Into<String>, config: TimeoutConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn duration(&self) -> Duration {
        self.config.timeout
    }

    pub async fn execute_with_result<F, Fut, T, E>(
        &self,
        ctx: &Context,
        op: F,
    ) -> Result<T, ExecutionError>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let started = Instant::now();
        match tokio::time::timeout(self.config.timeout, op(ctx.clone())).await {
            Ok(result) => result.map_err(|err| ExecutionError::from_boxed(err.into())),
            Err(_) => {
                let elapsed = started.elapsed();
                tracing::warn!(
                    timeout = %self.name,
                    limit_ms = self.config.timeout.as_millis() as u64,
                    "Operation timed out"
                );
                Err(ResilienceError::timeout(&self.name, self.config.timeout, elapsed)
                    .with_correlation_id(ctx.correlation_id())
                    .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rampart_core::{ErrorCode, ErrorDetails};
    use std::io;

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_times_out() {
        let timeout = Timeout::new("slow", TimeoutConfig::new(Duration::from_millis(500)));
        let ctx = Context::new();

        let err = timeout
            .execute_with_result(&ctx, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<u32, io::Error>(1)
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some(ErrorCode::Timeout));
        match err.resilience().unwrap().details() {
            ErrorDetails::Timeout { timeout, elapsed } => {
                assert_eq!(*timeout, Duration::from_millis(500));
                assert_eq!(*elapsed, Duration::from_millis(500));
            }
            other => panic!("unexpected details: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_operation_passes_through() {
        let timeout = Timeout::new("fast", TimeoutConfig::new(Duration::from_secs(1)));
        let value = timeout
            .execute_with_result(&Context::new(), |_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, io::Error>("done")
            })
            .await
            .unwrap();
        assert_eq!(value, "done");
    }
}
