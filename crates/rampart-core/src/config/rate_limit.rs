use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token-bucket rate limit configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens added per window
    pub rate: u32,

    #[serde(with = "super::duration")]
    pub window: Duration,

    /// Extra capacity above `rate`
    pub burst_size: u32,

    /// Block until a token is available instead of rejecting
    pub wait_on_limit: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate: 100,
            window: Duration::from_secs(1),
            burst_size: 10,
            wait_on_limit: false,
        }
    }
}

impl RateLimitConfig {
    /// Create a config admitting `rate` calls per `window` with no burst.
    pub fn new(rate: u32, window: Duration) -> Self {
        Self {
            rate,
            window,
            burst_size: 0,
            wait_on_limit: false,
        }
    }

    pub fn with_burst_size(mut self, burst: u32) -> Self {
        self.burst_size = burst;
        self
    }

    pub fn with_wait_on_limit(mut self, wait: bool) -> Self {
        self.wait_on_limit = wait;
        self
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> u64 {
        u64::from(self.rate) + u64::from(self.burst_size)
    }

    /// Time for one token to refill (`window / rate`).
    pub fn token_interval(&self) -> Duration {
        if self.rate == 0 {
            return self.window;
        }
        self.window / self.rate
    }
}
