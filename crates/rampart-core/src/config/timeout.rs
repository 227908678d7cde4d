use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-attempt timeout configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "super::duration")]
    pub timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}
