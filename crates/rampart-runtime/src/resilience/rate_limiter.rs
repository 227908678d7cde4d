//! Token-bucket admission control.
//!
//! The bucket starts full at `rate + burst_size` tokens and refills in whole
//! tokens: `floor(elapsed / window * rate)` are added on each check, and the
//! refill clock only advances when at least one token was added.

use super::race_context;
use crate::context::Context;
use crate::error::{BoxError, ExecutionError};
use parking_lot::Mutex;
use rampart_core::{RateLimitConfig, ResilienceError};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Floor for the `wait` polling interval.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Result of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    /// Time until one more token is available; zero when admitted
    pub retry_after: Duration,
}

/// Values a transport layer can expose as rate-limit response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
}

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    capacity: u64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a new rate limiter with a full bucket.
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let capacity = config.capacity();
        Self {
            name: name.into(),
            config,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// `window / rate`, the wait suggested to rejected callers.
    pub fn retry_after(&self) -> Duration {
        self.config.token_interval()
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let window = self.config.window.as_nanos().max(1);
        let to_add = elapsed.as_nanos() * u128::from(self.config.rate) / window;

        if to_add > 0 {
            let to_add = u64::try_from(to_add).unwrap_or(u64::MAX);
            bucket.tokens = bucket.tokens.saturating_add(to_add).min(self.capacity);
            bucket.last_refill = now;
        }
    }

    /// Take `n` tokens if all are available.
    pub fn decide(&self, n: u32) -> RateLimitDecision {
        let n = u64::from(n);
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);

        let allowed = bucket.tokens >= n;
        if allowed {
            bucket.tokens -= n;
        }
        RateLimitDecision {
            allowed,
            remaining: bucket.tokens,
            limit: self.capacity,
            retry_after: if allowed { Duration::ZERO } else { self.retry_after() },
        }
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        self.decide(1).allowed
    }

    /// Take `n` tokens at once, or none.
    pub fn allow_n(&self, n: u32) -> bool {
        self.decide(n).allowed
    }

    /// Tokens currently in the bucket, after refill.
    pub fn available_tokens(&self) -> u64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    pub fn headers(&self) -> RateLimitHeaders {
        let remaining = self.available_tokens();
        RateLimitHeaders {
            limit: self.capacity,
            remaining,
            reset_after: if remaining >= self.capacity {
                Duration::ZERO
            } else {
                self.retry_after()
            },
        }
    }

    /// Poll every `window / rate`, but no more often than once a
    /// millisecond, until a token is taken or `ctx` ends.
    pub async fn wait(&self, ctx: &Context) -> Result<(), ExecutionError> {
        let interval = self.retry_after().max(MIN_POLL_INTERVAL);
        loop {
            if self.allow() {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                reason = ctx.done() => return Err(reason),
            }
        }
    }

    /// Admit one call, waiting if configured to. Returns whether the caller
    /// was limited (rejected or made to wait).
    pub async fn acquire(&self, ctx: &Context) -> Result<bool, ExecutionError> {
        if self.allow() {
            return Ok(false);
        }

        if self.config.wait_on_limit {
            tracing::debug!(limiter = %self.name, "Rate limited, waiting for a token");
            self.wait(ctx).await?;
            return Ok(true);
        }

        tracing::warn!(limiter = %self.name, rate = self.config.rate, "Rate limit exceeded");
        Err(ResilienceError::rate_limited(
            &self.name,
            self.config.rate,
            self.config.window,
            self.retry_after(),
        )
        .with_correlation_id(ctx.correlation_id())
        .into())
    }

    pub async fn execute<F, Fut, E>(&self, ctx: &Context, op: F) -> Result<(), ExecutionError>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<BoxError>,
    {
        self.execute_with_result(ctx, op).await
    }

    /// Run `op` once admitted. Rejected calls never invoke `op`.
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
        self.acquire(ctx).await?;
        race_context(ctx, op(ctx.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rampart_core::{ErrorCode, ErrorDetails};
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limiter(rate: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(
            "test",
            RateLimitConfig::new(rate, Duration::from_secs(1)).with_burst_size(burst),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_eleventh_call_is_rejected() {
        let rl = limiter(10, 0);
        let ctx = Context::new();

        for _ in 0..10 {
            rl.execute(&ctx, |_| async { Ok::<(), io::Error>(()) })
                .await
                .unwrap();
        }

        let calls = AtomicU32::new(0);
        let err = rl
            .execute(&ctx, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), io::Error>(())
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(err.code(), Some(ErrorCode::RateLimited));
        match err.resilience().unwrap().details() {
            ErrorDetails::RateLimited {
                limit,
                window,
                retry_after,
            } => {
                assert_eq!(*limit, 10);
                assert_eq!(*window, Duration::from_secs(1));
                assert_eq!(*retry_after, Duration::from_millis(100));
            }
            other => panic!("unexpected details: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_adds_capacity() {
        let rl = limiter(5, 3);
        assert_eq!(rl.available_tokens(), 8);
        assert!(rl.allow_n(8));
        assert!(!rl.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_whole_tokens() {
        let rl = limiter(10, 0);
        assert!(rl.allow_n(10));

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(!rl.allow());

        tokio::time::advance(Duration::from_millis(151)).await;
        assert_eq!(rl.available_tokens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let rl = limiter(10, 2);
        rl.allow_n(3);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(rl.available_tokens(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_n_is_all_or_nothing() {
        let rl = limiter(4, 0);
        assert!(rl.allow_n(0));
        assert!(!rl.allow_n(5));
        assert_eq!(rl.available_tokens(), 4);
        assert!(rl.allow_n(3));
        assert!(!rl.allow_n(2));
        assert_eq!(rl.available_tokens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_on_limit_blocks_until_refill() {
        let rl = RateLimiter::new(
            "waiting",
            RateLimitConfig::new(10, Duration::from_secs(1)).with_wait_on_limit(true),
        );
        let ctx = Context::new();
        assert!(rl.allow_n(10));

        let started = Instant::now();
        let limited = rl.acquire(&ctx).await.unwrap();
        assert!(limited);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_with_truncated_interval_still_sleeps() {
        let rl = RateLimiter::new(
            "fast",
            RateLimitConfig::new(10_000, Duration::from_micros(1)).with_wait_on_limit(true),
        );
        assert_eq!(rl.retry_after(), Duration::ZERO);
        assert!(rl.allow_n(10_000));

        let started = Instant::now();
        rl.wait(&Context::new()).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_on_cancel() {
        let rl = limiter(1, 0);
        assert!(rl.allow());

        let ctx = Context::new().with_timeout(Duration::from_millis(250));
        let err = rl.wait(&ctx).await;
        assert!(matches!(err, Err(ExecutionError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_headers() {
        let rl = limiter(10, 0);
        assert_eq!(rl.headers().reset_after, Duration::ZERO);

        rl.allow_n(4);
        let headers = rl.headers();
        assert_eq!(headers.limit, 10);
        assert_eq!(headers.remaining, 6);
        assert_eq!(headers.reset_after, Duration::from_millis(100));

        let decision = rl.decide(7);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 6);
        assert_eq!(decision.retry_after, Duration::from_millis(100));
    }

    proptest! {
        #[test]
        fn prop_admissions_bounded_by_capacity(rate in 1u32..200, burst in 0u32..50, extra in 1u32..50) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            rt.block_on(async {
                let rl = limiter(rate, burst);
                let mut admitted = 0u32;
                for _ in 0..rate + burst + extra {
                    if rl.allow() {
                        admitted += 1;
                    }
                }
                assert_eq!(admitted, rate + burst);
                assert_eq!(rl.available_tokens(), 0);
            });
        }
    }
}
