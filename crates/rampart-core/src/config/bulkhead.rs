use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Concurrency bulkhead configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Operations allowed in flight at once
    pub max_concurrent: u32,

    /// Longest a queued caller waits for a slot
    #[serde(with = "super::duration")]
    pub max_wait: Duration,

    /// Callers allowed to wait simultaneously
    pub queue_size: u32,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_wait: Duration::from_secs(1),
            queue_size: 100,
        }
    }
}

impl BulkheadConfig {
    /// Create a config with `max_concurrent` slots and no queue.
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            max_concurrent,
            max_wait: Duration::ZERO,
            queue_size: 0,
        }
    }

    pub fn with_queue(mut self, queue_size: u32, max_wait: Duration) -> Self {
        self.queue_size = queue_size;
        self.max_wait = max_wait;
        self
    }

    /// Whether saturated callers may wait at all.
    pub fn allows_queueing(&self) -> bool {
        self.queue_size > 0 && !self.max_wait.is_zero()
    }
}
