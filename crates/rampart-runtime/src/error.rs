use rampart_core::{ErrorCode, ResilienceError, SharedError};
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error accepted from caller operations.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Error returned by every execute call.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    /// No policy is registered under the name.
    #[error("policy '{0}' not found")]
    PolicyNotFound(String),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The caller's operation failed.
    #[error(transparent)]
    Operation(SharedError),
}

impl ExecutionError {
    /// Wrap an operation error, unwrapping engine errors from nested calls.
    pub fn from_boxed(err: BoxError) -> Self {
        let err = match err.downcast::<ExecutionError>() {
            Ok(err) => return *err,
            Err(err) => err,
        };
        match err.downcast::<ResilienceError>() {
            Ok(err) => ExecutionError::Resilience(*err),
            Err(err) => ExecutionError::Operation(Arc::from(err)),
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ExecutionError::Resilience(err) => Some(err.code()),
            _ => None,
        }
    }

    pub fn resilience(&self) -> Option<&ResilienceError> {
        match self {
            ExecutionError::Resilience(err) => Some(err),
            _ => None,
        }
    }

    /// Admission was refused without running the operation.
    pub fn is_rejection(&self) -> bool {
        self.code().is_some_and(ErrorCode::is_rejection)
    }

    /// Cancellation or deadline expiry of the caller's context.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            ExecutionError::Cancelled | ExecutionError::DeadlineExceeded
        )
    }

    /// The error the retry predicate sees: the caller's own error for
    /// operation failures, this error otherwise.
    pub fn as_predicate_input(&self) -> &(dyn StdError + 'static) {
        match self {
            ExecutionError::Operation(inner) => {
                let inner: &(dyn StdError + 'static) = &**inner;
                inner
            }
            other => other,
        }
    }

    /// Downcast the caller's operation error.
    pub fn downcast_operation<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            ExecutionError::Operation(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub(crate) fn into_shared(self) -> SharedError {
        match self {
            ExecutionError::Operation(inner) => inner,
            other => Arc::new(other),
        }
    }
}
