//! Circuit breaker to stop calling a failing dependency.
//!
//! Repeated failures open the circuit and later calls fail fast with
//! `CIRCUIT_OPEN`. Once the open timeout has elapsed a limited number of
//! probes are admitted; enough probe successes close the circuit again,
//! a single probe failure reopens it.

use super::{race_context, OperationResult};
use crate::context::Context;
use crate::error::{BoxError, ExecutionError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rampart_core::{CircuitBreakerConfig, CircuitState, ResilienceError, StateChangeObserver};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure_at: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
    /// Failures counted when the circuit last opened
    trip_failures: u32,
    probes_in_flight: u32,
    /// Bumped on every transition so results from an older epoch are dropped
    epoch: u64,
    /// Feeds the task that notifies observers, in transition order
    deliveries: Option<mpsc::UnboundedSender<Transition>>,
    /// Transitions waiting for inline delivery when no runtime is available
    pending: VecDeque<Transition>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure_at: None,
            last_failure_wall: None,
            last_state_change: Utc::now(),
            trip_failures: 0,
            probes_in_flight: 0,
            epoch: 0,
            deliveries: None,
            pending: VecDeque::new(),
        }
    }
}

type Transition = (CircuitState, CircuitState);

type Observers = Arc<[Arc<dyn StateChangeObserver>]>;

/// Per-dependency health gate.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    observers: Observers,
    inner: Mutex<BreakerState>,
    /// Held by whichever caller is draining `pending`
    inline_delivery: Mutex<()>,
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`CircuitPermit::success`] or
/// [`CircuitPermit::failure`]. Dropping the permit without reporting frees
/// its probe slot and records nothing.
#[must_use = "report the outcome with success() or failure()"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    probe: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// The state the call was admitted in.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.epoch, self.probe, Some(true));
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.epoch, self.probe, Some(false));
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.epoch, self.probe, None);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker. The config's observer, if any, is
    /// notified of every transition.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let observers = config.on_state_change.iter().cloned().collect();
        Self {
            name: name.into(),
            config,
            observers,
            inner: Mutex::new(BreakerState::new()),
            inline_delivery: Mutex::new(()),
        }
    }

    /// Add another transition observer.
    pub fn with_observer(mut self, observer: Arc<dyn StateChangeObserver>) -> Self {
        let mut observers = self.observers.to_vec();
        observers.push(observer);
        self.observers = observers.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. Does not advance Open to HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            service: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            last_failure_at: inner.last_failure_wall,
            last_state_change: inner.last_state_change,
        }
    }

    /// Check admissibility, moving Open to HalfOpen once the timeout has
    /// strictly elapsed since the last failure.
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, ResilienceError> {
        let admitted = {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Open {
                let now = Instant::now();
                let cooled = inner
                    .last_failure_at
                    .map_or(true, |at| now.duration_since(at) > self.config.timeout);
                if cooled {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                }
            }

            match inner.state {
                CircuitState::Closed => Ok((inner.epoch, false)),
                CircuitState::HalfOpen if inner.probes_in_flight < self.config.half_open_requests => {
                    inner.probes_in_flight += 1;
                    Ok((inner.epoch, true))
                }
                _ => Err(self.rejection(&inner)),
            }
        };
        self.deliver_pending();

        let (epoch, probe) = admitted?;
        Ok(CircuitPermit {
            breaker: self,
            epoch,
            probe,
            settled: false,
        })
    }

    /// Run `op` if the circuit admits it and record the outcome.
    pub async fn execute<F, Fut, E>(&self, ctx: &Context, op: F) -> Result<(), ExecutionError>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<BoxError>,
    {
        self.execute_with_result(ctx, op).await
    }

    /// Typed-result variant of [`CircuitBreaker::execute`].
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
        let permit = self
            .try_acquire()
            .map_err(|err| err.with_correlation_id(ctx.correlation_id()))?;

        let result: OperationResult<T> = race_context(ctx, op(ctx.clone())).await;
        match &result {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        result
    }

    /// Record a success against the current state.
    pub fn record_success(&self) {
        {
            let mut inner = self.inner.lock();
            let epoch = inner.epoch;
            self.apply(&mut inner, epoch, true);
        }
        self.deliver_pending();
    }

    /// Record a failure against the current state.
    pub fn record_failure(&self) {
        {
            let mut inner = self.inner.lock();
            let epoch = inner.epoch;
            self.apply(&mut inner, epoch, false);
        }
        self.deliver_pending();
    }

    /// Force the circuit closed with zeroed counters.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, CircuitState::Closed);
            inner.last_failure_at = None;
            inner.last_failure_wall = None;
        }
        tracing::info!(circuit = %self.name, "Circuit reset");
        self.deliver_pending();
    }

    fn settle(&self, epoch: u64, probe: bool, outcome: Option<bool>) {
        {
            let mut inner = self.inner.lock();
            if probe && inner.epoch == epoch {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            }
            if let Some(success) = outcome {
                self.apply(&mut inner, epoch, success);
            }
        }
        self.deliver_pending();
    }

    fn apply(&self, inner: &mut BreakerState, epoch: u64, success: bool) {
        // Results admitted before the last transition belong to a finished epoch.
        if inner.epoch != epoch {
            return;
        }

        match (inner.state, success) {
            (CircuitState::Closed, true) => inner.failures = 0,
            (CircuitState::Closed, false) => {
                inner.failures += 1;
                Self::mark_failure(inner);
                if inner.failures >= self.config.failure_threshold {
                    inner.trip_failures = inner.failures;
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failures,
                        "Circuit opened after repeated failures"
                    );
                    self.transition(inner, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, true) => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    tracing::info!(circuit = %self.name, "Circuit closed after successful recovery");
                    self.transition(inner, CircuitState::Closed);
                }
            }
            (CircuitState::HalfOpen, false) => {
                Self::mark_failure(inner);
                inner.trip_failures = 1;
                tracing::warn!(circuit = %self.name, "Circuit reopened after failed probe");
                self.transition(inner, CircuitState::Open);
            }
            (CircuitState::Open, _) => {}
        }
    }

    fn mark_failure(inner: &mut BreakerState) {
        inner.last_failure_at = Some(Instant::now());
        inner.last_failure_wall = Some(Utc::now());
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.failures = 0;
        inner.successes = 0;
        inner.probes_in_flight = 0;
        inner.epoch += 1;
        inner.last_state_change = Utc::now();

        if to == CircuitState::HalfOpen {
            tracing::info!(circuit = %self.name, "Circuit half-open, admitting probes");
        }
        if from != to {
            self.enqueue(inner, (from, to));
        }
    }

    /// Queue a transition for observers. Runs under the state lock, so the
    /// queue order is the transition order.
    fn enqueue(&self, inner: &mut BreakerState, transition: Transition) {
        if self.observers.is_empty() {
            return;
        }

        let transition = match &inner.deliveries {
            Some(sender) => match sender.send(transition) {
                Ok(()) => return,
                // The delivery task's runtime has shut down.
                Err(mpsc::error::SendError(transition)) => transition,
            },
            None => transition,
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (sender, receiver) = mpsc::unbounded_channel();
                handle.spawn(deliver(Arc::clone(&self.observers), receiver));
                if sender.send(transition).is_err() {
                    tracing::debug!(circuit = %self.name, "Observer delivery task unavailable");
                }
                inner.deliveries = Some(sender);
            }
            Err(_) => {
                inner.deliveries = None;
                inner.pending.push_back(transition);
            }
        }
    }

    /// Notify observers inline of transitions queued outside a runtime.
    /// Only one caller drains at a time; the lock is never held while an
    /// observer runs.
    fn deliver_pending(&self) {
        loop {
            {
                let Some(_draining) = self.inline_delivery.try_lock() else {
                    return;
                };
                loop {
                    let next = self.inner.lock().pending.pop_front();
                    let Some((from, to)) = next else {
                        break;
                    };
                    for observer in self.observers.iter() {
                        observer.on_state_change(from, to);
                    }
                }
            }
            // A transition queued while the drain lock was being released
            // would otherwise wait for the next call.
            if self.inner.lock().pending.is_empty() {
                return;
            }
        }
    }

    fn rejection(&self, inner: &BreakerState) -> ResilienceError {
        let (reset_after, opened_at) = match inner.last_failure_at {
            Some(at) => (
                self.config.timeout.saturating_sub(at.elapsed()),
                inner.last_failure_wall.unwrap_or(inner.last_state_change),
            ),
            None => (self.config.timeout, inner.last_state_change),
        };
        let failure_rate =
            f64::from(inner.trip_failures) / f64::from(self.config.failure_threshold.max(1));

        tracing::debug!(circuit = %self.name, state = %inner.state, "Call rejected by open circuit");
        ResilienceError::circuit_open(&self.name, opened_at, reset_after, failure_rate)
    }
}

/// Drains one breaker's transitions, in order, until the breaker is dropped.
async fn deliver(observers: Observers, mut transitions: mpsc::UnboundedReceiver<Transition>) {
    while let Some((from, to)) = transitions.recv().await {
        for observer in observers.iter() {
            observer.on_state_change(from, to);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use rampart_core::{ErrorCode, ErrorDetails};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn breaker(failures: u32, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default()
                .with_failure_threshold(failures)
                .with_success_threshold(successes)
                .with_timeout(Duration::from_secs(30)),
        )
    }

    async fn fail(cb: &CircuitBreaker, ctx: &Context) -> Result<(), ExecutionError> {
        cb.execute(ctx, |_| async { Err::<(), _>(io::Error::new(io::ErrorKind::Other, "down")) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker, ctx: &Context) -> Result<(), ExecutionError> {
        cb.execute(ctx, |_| async { Ok::<(), io::Error>(()) }).await
    }

    async fn settle_observers() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = breaker(5, 2);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = breaker(3, 1);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold_and_rejects_without_calling() {
        let cb = breaker(5, 2);
        let ctx = Context::new();

        for _ in 0..4 {
            assert!(fail(&cb, &ctx).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(fail(&cb, &ctx).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result = cb
            .execute(&ctx, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), io::Error>(())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let err = result.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::CircuitOpen));
        assert_eq!(err.resilience().unwrap().correlation_id(), ctx.correlation_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_is_strict() {
        let cb = breaker(1, 2);
        let ctx = Context::new();
        fail(&cb, &ctx).await.unwrap_err();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.try_acquire().is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        let permit = cb.try_acquire().unwrap();
        assert!(permit.is_probe());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        permit.success();
        assert_eq!(cb.snapshot().successes, 1);

        cb.try_acquire().unwrap().success();
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failures, 0);
        assert_eq!(snapshot.successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(2, 3);
        let ctx = Context::new();
        fail(&cb, &ctx).await.unwrap_err();
        fail(&cb, &ctx).await.unwrap_err();

        tokio::time::advance(Duration::from_secs(31)).await;
        succeed(&cb, &ctx).await.unwrap();
        succeed(&cb, &ctx).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        fail(&cb, &ctx).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_budget_limits_concurrent_probes() {
        let cb = breaker(1, 1);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(31)).await;

        let first = cb.try_acquire().unwrap();
        let second = cb.try_acquire();
        assert_eq!(second.err().map(|e| e.code()), Some(ErrorCode::CircuitOpen));

        // An abandoned probe frees its slot.
        drop(first);
        let third = cb.try_acquire().unwrap();
        third.success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_results_from_previous_epoch_are_ignored() {
        let cb = breaker(1, 1);
        let early = cb.try_acquire().unwrap();

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        early.success();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.snapshot().successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_details() {
        let cb = breaker(2, 1);
        cb.record_failure();
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        let err = cb.try_acquire().err().unwrap();
        match err.details() {
            ErrorDetails::CircuitOpen {
                reset_after,
                failure_rate,
                ..
            } => {
                assert_eq!(*reset_after, Duration::from_secs(20));
                assert_eq!(*failure_rate, 1.0);
            }
            other => panic!("unexpected details: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forces_closed() {
        let cb = breaker(1, 1);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failures, 0);
        assert!(snapshot.last_failure_at.is_none());
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_every_transition() {
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_success_threshold(1)
            .with_timeout(Duration::from_secs(1))
            .with_observer(move |from: CircuitState, to: CircuitState| {
                sink.lock().push((from, to));
            });
        let cb = CircuitBreaker::new("observed", config);

        cb.record_failure();
        settle_observers().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        cb.try_acquire().unwrap().success();
        settle_observers().await;

        assert_eq!(
            *seen.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_observer_order_across_worker_threads() {
        for _ in 0..50 {
            let seen = Arc::new(SyncMutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            let cb = CircuitBreaker::new(
                "ordered",
                CircuitBreakerConfig::default()
                    .with_failure_threshold(1)
                    .with_success_threshold(1)
                    .with_timeout(Duration::from_millis(1))
                    .with_observer(move |_from: CircuitState, to: CircuitState| {
                        sink.lock().push(to);
                    }),
            );
            let ctx = Context::new();

            fail(&cb, &ctx).await.unwrap_err();
            tokio::time::sleep(Duration::from_millis(3)).await;
            succeed(&cb, &ctx).await.unwrap();

            let deadline = Instant::now() + Duration::from_secs(5);
            while seen.lock().len() < 3 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            assert_eq!(
                *seen.lock(),
                vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
            );
        }
    }

    #[test]
    fn test_observer_reading_state_runs_inline() {
        let slot = Arc::new(std::sync::OnceLock::<Arc<CircuitBreaker>>::new());
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let (handle, sink) = (Arc::clone(&slot), Arc::clone(&seen));
        let gate = Arc::new(breaker(1, 1).with_observer(Arc::new(
            move |_: CircuitState, to: CircuitState| {
                let current = handle.get().map(|cb| cb.state());
                sink.lock().push((to, current));
            },
        )));
        let _ = slot.set(Arc::clone(&gate));

        gate.record_failure();
        gate.reset();
        assert_eq!(
            *seen.lock(),
            vec![
                (CircuitState::Open, Some(CircuitState::Open)),
                (CircuitState::Closed, Some(CircuitState::Closed)),
            ]
        );
    }

    #[test]
    fn test_observer_runs_inline_without_runtime() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let cb = breaker(1, 1).with_observer(Arc::new(move |_: CircuitState, _: CircuitState| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        cb.record_failure();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_counts_as_failure() {
        let cb = breaker(1, 1);
        let ctx = Context::new();
        let cancel = ctx.clone();

        let result = cb
            .execute(&ctx, |_| async move {
                cancel.cancel();
                std::future::pending::<Result<(), io::Error>>().await
            })
            .await;

        assert!(matches!(result, Err(ExecutionError::Cancelled)));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_opens_exactly_at_threshold(threshold in 1u32..50) {
                let cb = breaker(threshold, 1);
                for _ in 0..threshold - 1 {
                    cb.record_failure();
                }
                prop_assert_eq!(cb.state(), CircuitState::Closed);

                cb.record_failure();
                prop_assert_eq!(cb.state(), CircuitState::Open);
                prop_assert!(cb.try_acquire().is_err());
            }
        }
    }
}
