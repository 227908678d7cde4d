//! Per-call execution context.
//!
//! A [`Context`] carries the caller's correlation id, a cancellation token
//! and an optional deadline. Every blocking point in the engine (retry
//! sleeps, rate-limiter waits, bulkhead queueing, the operation itself)
//! races against [`Context::done`].

use crate::error::ExecutionError;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Cancellation, deadline and correlation id for one logical call.
#[derive(Debug, Clone)]
pub struct Context {
    correlation_id: String,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a context with a fresh correlation id and no deadline.
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Bound the context by `timeout` from now. An earlier deadline wins.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Derive a context that is cancelled with this one but can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            cancellation: self.cancellation.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Return the reason this context is finished, if it is.
    pub fn check(&self) -> Result<(), ExecutionError> {
        if self.cancellation.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ExecutionError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ExecutionError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancellation.cancelled() => ExecutionError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ExecutionError::DeadlineExceeded,
            },
            None => {
                self.cancellation.cancelled().await;
                ExecutionError::Cancelled
            }
        }
    }
}
