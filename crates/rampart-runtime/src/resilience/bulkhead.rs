//! Concurrency bulkhead.
//!
//! A fair semaphore bounds in-flight operations at `max_concurrent`. When it
//! is saturated, up to `queue_size` callers wait in FIFO order for at most
//! `max_wait` each; everyone else is turned away with `BULKHEAD_FULL`.

use super::race_context;
use crate::context::Context;
use crate::error::{BoxError, ExecutionError};
use rampart_core::{BulkheadConfig, ResilienceError};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};

/// Bulkhead utilization counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulkheadMetrics {
    pub max_concurrent: u32,
    pub active: u32,
    pub queued: u32,
    pub rejected: u64,
    pub completed: u64,
}

/// Slot in the bulkhead, released on drop.
#[derive(Debug)]
pub struct BulkheadPermit<'a> {
    _permit: SemaphorePermit<'a>,
    bulkhead: &'a Bulkhead,
    queued: bool,
}

impl BulkheadPermit<'_> {
    /// Whether the caller had to wait in the queue.
    pub fn was_queued(&self) -> bool {
        self.queued
    }
}

impl Drop for BulkheadPermit<'_> {
    fn drop(&mut self) {
        self.bulkhead.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Holds a queue slot while a caller waits.
struct QueueSlot<'a>(&'a AtomicU32);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    semaphore: Semaphore,
    waiting: AtomicU32,
    rejected: AtomicU64,
    completed: AtomicU64,
}

impl Bulkhead {
    /// Create a new bulkhead.
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            name: name.into(),
            semaphore: Semaphore::new(config.max_concurrent as usize),
            config,
            waiting: AtomicU32::new(0),
            rejected: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    fn active(&self) -> u32 {
        let available = u32::try_from(self.semaphore.available_permits()).unwrap_or(u32::MAX);
        self.config.max_concurrent.saturating_sub(available)
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            max_concurrent: self.config.max_concurrent,
            active: self.active(),
            queued: self.waiting.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, ctx: &Context) -> ExecutionError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        let load = self.active() + self.waiting.load(Ordering::SeqCst);
        tracing::warn!(
            bulkhead = %self.name,
            max_concurrent = self.config.max_concurrent,
            current_load = load,
            "Bulkhead capacity exceeded"
        );
        ResilienceError::bulkhead_full(
            &self.name,
            self.config.max_concurrent,
            self.config.queue_size,
            load,
        )
        .with_correlation_id(ctx.correlation_id())
        .into()
    }

    /// Take a slot, queueing if the config allows it.
    pub async fn acquire(&self, ctx: &Context) -> Result<BulkheadPermit<'_>, ExecutionError> {
        match self.semaphore.try_acquire() {
            Ok(permit) => return Ok(self.permit(permit, false)),
            Err(TryAcquireError::NoPermits) => {}
            Err(TryAcquireError::Closed) => return Err(self.reject(ctx)),
        }

        if !self.config.allows_queueing() {
            return Err(self.reject(ctx));
        }

        let queue_size = self.config.queue_size;
        let reserved = self
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |waiting| {
                (waiting < queue_size).then_some(waiting + 1)
            })
            .is_ok();
        if !reserved {
            return Err(self.reject(ctx));
        }
        let slot = QueueSlot(&self.waiting);

        tracing::debug!(bulkhead = %self.name, "Bulkhead saturated, queueing");
        let acquired = tokio::select! {
            acquired = tokio::time::timeout(self.config.max_wait, self.semaphore.acquire()) => acquired,
            reason = ctx.done() => return Err(reason),
        };
        drop(slot);

        match acquired {
            Ok(Ok(permit)) => Ok(self.permit(permit, true)),
            _ => Err(self.reject(ctx)),
        }
    }

    fn permit<'a>(&'a self, permit: SemaphorePermit<'a>, queued: bool) -> BulkheadPermit<'a> {
        BulkheadPermit {
            _permit: permit,
            bulkhead: self,
            queued,
        }
    }

    pub async fn execute<F, Fut, E>(&self, ctx: &Context, op: F) -> Result<(), ExecutionError>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<BoxError>,
    {
        self.execute_with_result(ctx, op).await
    }

    /// Run `op` inside the bulkhead. The slot is released however `op` ends.
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
        let _permit = self.acquire(ctx).await?;
        race_context(ctx, op(ctx.clone())).await
    }
}
