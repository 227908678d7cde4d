//! Named policies bound to composed execution chains.
//!
//! A registered [`Policy`] becomes a [`PolicyChain`] holding one primitive
//! per present sub-config. Calls run through the chain outermost first:
//!
//! 1. rate limiter admission, once per call
//! 2. bulkhead admission, once per call
//! 3. retry loop, and for every attempt:
//!    circuit breaker admission, then the operation under the timeout
//!
//! Retries never re-enter rate limiting or the bulkhead, and every attempt is
//! visible to the circuit breaker.

use crate::context::Context;
use crate::error::{BoxError, ExecutionError};
use crate::observability::{MetricsRecorder, NoopRecorder};
use crate::resilience::{
    Bulkhead, CircuitBreaker, CircuitPermit, RateLimiter, RetryExecutor, Timeout,
};
use parking_lot::RwLock;
use rampart_core::{
    CircuitState, ExecutionMetrics, Policy, ResilienceError, StateChangeObserver, Validate,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// The primitives built for one registered policy.
pub struct PolicyChain {
    policy: Policy,
    rate_limiter: Option<RateLimiter>,
    bulkhead: Option<Bulkhead>,
    circuit_breaker: Option<CircuitBreaker>,
    retry: Option<RetryExecutor>,
    timeout: Option<Timeout>,
    recorder: Arc<dyn MetricsRecorder>,
}

type Admitted<'a, Fut> = Result<(Option<CircuitPermit<'a>>, Fut), ExecutionError>;

impl PolicyChain {
    /// Build primitives for an already validated policy.
    fn build(policy: Policy, recorder: Arc<dyn MetricsRecorder>) -> Self {
        let name = policy.name.clone();

        let circuit_breaker = policy.circuit_breaker.clone().map(|config| {
            let recorder = Arc::clone(&recorder);
            let policy_name = name.clone();
            let forward: Arc<dyn StateChangeObserver> =
                Arc::new(move |_from: CircuitState, to: CircuitState| {
                    recorder.record_circuit_state(&policy_name, to);
                });
            CircuitBreaker::new(name.clone(), config).with_observer(forward)
        });

        let retry = policy.retry.clone().map(|config| {
            let recorder = Arc::clone(&recorder);
            let policy_name = name.clone();
            RetryExecutor::new(name.clone(), config).with_listener(move |event| {
                recorder.record_retry_attempt(&policy_name, event.attempt);
            })
        });

        Self {
            rate_limiter: policy
                .rate_limit
                .clone()
                .map(|config| RateLimiter::new(name.clone(), config)),
            bulkhead: policy
                .bulkhead
                .clone()
                .map(|config| Bulkhead::new(name.clone(), config)),
            timeout: policy
                .timeout
                .clone()
                .map(|config| Timeout::new(name.clone(), config)),
            circuit_breaker,
            retry,
            recorder,
            policy,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn name(&self) -> &str {
        &self.policy.name
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    /// Run `op` through the chain and report one [`ExecutionMetrics`].
    pub async fn execute_with_result<F, Fut, T, E>(
        &self,
        ctx: &Context,
        op: F,
    ) -> Result<T, ExecutionError>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let mut metrics = ExecutionMetrics::new(self.name());

        let result = self.run(ctx, &mut metrics, &attempts, op).await;

        metrics.duration = started.elapsed();
        metrics.success = result.is_ok();
        metrics.retry_attempts = attempts.load(Ordering::Relaxed).saturating_sub(1);
        metrics.circuit_state = self.circuit_breaker.as_ref().map(CircuitBreaker::state);
        metrics.error_code = result.as_ref().err().and_then(ExecutionError::code);
        self.recorder.record_execution(&metrics);

        result
    }

    async fn run<F, Fut, T, E>(
        &self,
        ctx: &Context,
        metrics: &mut ExecutionMetrics,
        attempts: &AtomicU32,
        mut op: F,
    ) -> Result<T, ExecutionError>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let name = self.name();

        if let Some(limiter) = &self.rate_limiter {
            match limiter.acquire(ctx).await {
                Ok(limited) => {
                    metrics.rate_limited = limited;
                    self.recorder.record_rate_limit(name, limited);
                }
                Err(err) => {
                    metrics.rate_limited = true;
                    self.recorder.record_rate_limit(name, true);
                    return Err(err);
                }
            }
        }

        let _slot = match &self.bulkhead {
            Some(bulkhead) => {
                let permit = bulkhead.acquire(ctx).await?;
                metrics.bulkhead_queued = permit.was_queued();
                self.recorder.record_bulkhead_queue(name, permit.was_queued());
                Some(permit)
            }
            None => None,
        };

        let chain = self;
        let attempt = move |attempt_ctx: Context| {
            attempts.fetch_add(1, Ordering::Relaxed);
            let admitted: Result<Option<CircuitPermit<'_>>, ExecutionError> =
                match &chain.circuit_breaker {
                    Some(breaker) => breaker.try_acquire().map(Some).map_err(|err| {
                        ExecutionError::from(err.with_correlation_id(attempt_ctx.correlation_id()))
                    }),
                    None => Ok(None),
                };
            let call = admitted.map(|permit| (permit, op(attempt_ctx.clone())));
            chain.attempt(attempt_ctx, call)
        };

        match &self.retry {
            Some(retry) => retry.execute_with_result(ctx, attempt).await,
            None => {
                let mut attempt = attempt;
                attempt(ctx.clone()).await
            }
        }
    }

    /// One attempt: the operation bounded by the timeout and the caller's
    /// context, with the outcome reported to the breaker.
    async fn attempt<'a, Fut, T, E>(
        &'a self,
        ctx: Context,
        call: Admitted<'a, Fut>,
    ) -> Result<T, ExecutionError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let (permit, fut) = call?;

        let bounded = async {
            match &self.timeout {
                Some(timeout) => timeout.execute_with_result(&ctx, |_| fut).await,
                None => fut.await.map_err(|err| ExecutionError::from_boxed(err.into())),
            }
        };
        let result = tokio::select! {
            biased;
            result = bounded => result,
            reason = ctx.done() => Err(reason),
        };

        if let Some(permit) = permit {
            match &result {
                Ok(_) => permit.success(),
                Err(_) => permit.failure(),
            }
        }
        result
    }
}

impl std::fmt::Debug for PolicyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyChain")
            .field("policy", &self.policy.name)
            .field("version", &self.policy.version)
            .field("rate_limiter", &self.rate_limiter.is_some())
            .field("bulkhead", &self.bulkhead.is_some())
            .field("circuit_breaker", &self.circuit_breaker.is_some())
            .field("retry", &self.retry.is_some())
            .field("timeout", &self.timeout.is_some())
            .finish()
    }
}

/// Registry of named policies.
///
/// Lookups hold the read lock only long enough to clone the chain handle,
/// so long-running operations never block registration. Replacing or
/// removing a policy leaves in-flight calls on the old chain untouched.
pub struct PolicyRegistry {
    policies: RwLock<HashMap<String, Arc<PolicyChain>>>,
    recorder: Arc<dyn MetricsRecorder>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    /// Create a registry that discards telemetry.
    pub fn new() -> Self {
        Self::with_recorder(Arc::new(NoopRecorder))
    }

    /// Create a registry reporting to `recorder`.
    pub fn with_recorder(recorder: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            recorder,
        }
    }

    /// Validate and register a policy, replacing any policy of the same name.
    ///
    /// An invalid policy is not registered and leaves any previous
    /// registration under that name in place.
    pub fn register_policy(&self, policy: Policy) -> Result<(), ResilienceError> {
        if let Err(err) = policy.validate() {
            tracing::warn!(policy = %policy.name, error = %err, "Rejected invalid policy");
            return Err(err);
        }

        let name = policy.name.clone();
        let version = policy.version;
        let chain = Arc::new(PolicyChain::build(policy, Arc::clone(&self.recorder)));
        let replaced = self.policies.write().insert(name.clone(), chain).is_some();

        tracing::info!(policy = %name, version, replaced, "Policy registered");
        Ok(())
    }

    /// Remove a policy. Returns whether it was registered.
    pub fn unregister_policy(&self, name: &str) -> bool {
        let removed = self.policies.write().remove(name).is_some();
        if removed {
            tracing::info!(policy = %name, "Policy unregistered");
        }
        removed
    }

    /// Registered policy names, sorted.
    pub fn policy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.read().contains_key(name)
    }

    /// The composed chain currently registered under `name`.
    pub fn chain(&self, name: &str) -> Option<Arc<PolicyChain>> {
        self.policies.read().get(name).cloned()
    }

    /// The registered configuration under `name`.
    pub fn policy(&self, name: &str) -> Option<Policy> {
        self.chain(name).map(|chain| chain.policy().clone())
    }

    /// Breaker state of a policy, when it has a breaker.
    pub fn circuit_state(&self, name: &str) -> Option<CircuitState> {
        self.chain(name)
            .and_then(|chain| chain.circuit_breaker().map(CircuitBreaker::state))
    }

    /// Force a policy's breaker closed. Returns false when there is none.
    pub fn reset_circuit(&self, name: &str) -> bool {
        match self.chain(name) {
            Some(chain) => match chain.circuit_breaker() {
                Some(breaker) => {
                    breaker.reset();
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    fn lookup(&self, name: &str) -> Result<Arc<PolicyChain>, ExecutionError> {
        self.chain(name).ok_or_else(|| {
            tracing::debug!(policy = %name, "Execute on unknown policy");
            ExecutionError::PolicyNotFound(name.to_string())
        })
    }

    /// Run `op` through the named policy.
    pub async fn execute<F, Fut, E>(
        &self,
        ctx: &Context,
        name: &str,
        op: F,
    ) -> Result<(), ExecutionError>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<BoxError>,
    {
        self.execute_with_result(ctx, name, op).await
    }

    /// Run `op` through the named policy and return its value.
    pub async fn execute_with_result<F, Fut, T, E>(
        &self,
        ctx: &Context,
        name: &str,
        op: F,
    ) -> Result<T, ExecutionError>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let chain = self.lookup(name)?;
        chain.execute_with_result(ctx, op).await
    }
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("policies", &self.policy_names())
            .finish()
    }
}
