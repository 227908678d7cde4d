use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether a failed attempt should be retried.
pub type RetryPredicate = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

/// Randomization applied to a capped backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Delay is used unchanged
    None,

    /// Uniform in `[0, delay)`
    #[default]
    Full,

    /// `delay/2 + uniform(0, delay/2)`
    Equal,

    /// `delay * (1 + uniform(0, 1))`, may exceed the cap
    Decorrelated,
}

/// Retry configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "super::duration")]
    pub initial_interval: Duration,

    /// Upper bound for the pre-jitter delay
    #[serde(with = "super::duration")]
    pub max_interval: Duration,

    /// Growth factor between attempts
    pub multiplier: f64,

    pub jitter: JitterStrategy,

    /// Which errors are retryable; `None` retries everything
    #[serde(skip)]
    pub retry_if: Option<RetryPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: JitterStrategy::Full,
            retry_if: None,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Only retry errors for which `predicate` returns true.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Evaluate the configured predicate.
    pub fn should_retry(&self, error: &(dyn Error + 'static)) -> bool {
        self.retry_if.as_ref().map_or(true, |predicate| predicate(error))
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_interval", &self.initial_interval)
            .field("max_interval", &self.max_interval)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("retry_if", &self.retry_if.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(10));
        assert_eq!(config.multiplier, 2.0);
        assert_eq!(config.jitter, JitterStrategy::Full);
    }

    #[test]
    fn test_retry_all_by_default() {
        let config = RetryConfig::default();
        let err = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(config.should_retry(&err));
    }

    #[test]
    fn test_predicate_downcasts() {
        let config = RetryConfig::default().retry_if(|err| {
            err.downcast_ref::<io::Error>()
                .is_some_and(|e| e.kind() == io::ErrorKind::TimedOut)
        });

        let transient = io::Error::new(io::ErrorKind::TimedOut, "slow");
        let fatal = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(config.should_retry(&transient));
        assert!(!config.should_retry(&fatal));
    }

    #[test]
    fn test_jitter_serde() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"jitter": "decorrelated", "initial_interval": "250ms"}"#)
                .unwrap();
        assert_eq!(config.jitter, JitterStrategy::Decorrelated);
        assert_eq!(config.initial_interval, Duration::from_millis(250));
        assert_eq!(config.max_attempts, 3);
    }
}
