use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use axonpuls_helpers::time::{Clock, DefaultClock};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::errors::ResilienceError;
use crate::strategy::RetryStrategy;

const ERROR_WINDOW: usize = 20;
const DEFAULT_JITTER_RANGE: f64 = 0.1;

struct Cancellation {
    cancelled: AtomicBool,
}

/// Tracks the recent outcome of a named operation so the `Adaptive`
/// strategy can weight delay by observed error rate.
#[derive(Default)]
struct ErrorHistory {
    recent: std::collections::VecDeque<bool>,
}

impl ErrorHistory {
    fn record(&mut self, failed: bool) {
        self.recent.push_back(failed);
        if self.recent.len() > ERROR_WINDOW {
            self.recent.pop_front();
        }
    }

    fn error_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failures = self.recent.iter().filter(|f| **f).count();
        failures as f64 / self.recent.len() as f64
    }
}

/// Owns every named circuit breaker and in-flight retry operation for a
/// node. One engine instance per process; every outbound call that needs
/// resilience (Redis writes, cross-server publishes, webhook dispatch)
/// goes through it keyed by a stable operation id.
pub struct ResilienceEngine {
    clock: Arc<dyn Clock>,
    breaker_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    error_histories: Mutex<HashMap<String, ErrorHistory>>,
    cancellations: Mutex<HashMap<String, Arc<Cancellation>>>,
    active_retries: Arc<AtomicUsize>,
}

impl ResilienceEngine {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        ResilienceEngine {
            clock: Arc::new(DefaultClock::new()),
            breaker_config,
            breakers: Mutex::new(HashMap::new()),
            error_histories: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
            active_retries: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn breaker_for(&self, id: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    id.to_string(),
                    self.breaker_config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub async fn breaker_state(&self, id: &str) -> CircuitState {
        self.breaker_for(id).await.state()
    }

    /// Removes the cancellation flag and circuit breaker tracked for `id`,
    /// cancelling any pending timer for an in-flight retry loop.
    pub async fn cancel(&self, id: &str) {
        if let Some(cancellation) = self.cancellations.lock().await.get(id) {
            cancellation.cancelled.store(true, Ordering::Release);
        }
    }

    /// Runs `op` under the named circuit breaker only (no retry loop):
    /// fails fast with `CircuitOpen` if the breaker denies the call,
    /// otherwise executes once and records the outcome.
    pub async fn execute_with_circuit_breaker<T, E, Fut, Op>(
        &self,
        id: &str,
        mut op: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        let breaker = self.breaker_for(id).await;
        breaker.check::<E>()?;

        match op().await {
            Ok(value) => {
                breaker.on_success();
                Ok(value)
            }
            Err(err) => {
                breaker.on_failure();
                Err(ResilienceError::Inner(err))
            }
        }
    }

    /// Runs `op`, retrying per `strategy` up to `max_attempts` times.
    /// `should_retry` decides whether a given inner error is retryable at
    /// all (validation/authorization failures should return `false`).
    /// Also consults a circuit breaker keyed by `id`: a breaker trip during
    /// any attempt aborts the retry loop immediately, matching the spec's
    /// rule that a breaker-open result is a distinct non-retryable error.
    pub async fn execute_with_retry<T, E, Fut, Op>(
        &self,
        id: &str,
        strategy: &RetryStrategy,
        max_attempts: usize,
        should_retry: impl Fn(&E) -> bool,
        mut op: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        E: std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        let cancellation = Arc::new(Cancellation {
            cancelled: AtomicBool::new(false),
        });
        self.cancellations
            .lock()
            .await
            .insert(id.to_string(), cancellation.clone());
        self.active_retries.fetch_add(1, Ordering::AcqRel);

        let breaker = self.breaker_for(id).await;
        let mut failures = Vec::new();
        let result = 'retry_loop: loop {
            let attempt = failures.len() as u32 + 1;

            if cancellation.cancelled.load(Ordering::Acquire) {
                break 'retry_loop Err(ResilienceError::Cancelled);
            }

            if let Err(open) = breaker.check::<E>() {
                break 'retry_loop Err(open);
            }

            tracing::debug!(operation = id, attempt, "retry attempt");
            match op().await {
                Ok(value) => {
                    breaker.on_success();
                    self.record_outcome(id, false).await;
                    tracing::info!(operation = id, attempt, "retry succeeded");
                    break 'retry_loop Ok(value);
                }
                Err(err) => {
                    breaker.on_failure();
                    self.record_outcome(id, true).await;
                    let message = err.to_string();
                    tracing::warn!(operation = id, attempt, error = %message, "retry attempt failed");
                    failures.push(message);

                    if !should_retry(&err) {
                        break 'retry_loop Err(ResilienceError::Inner(err));
                    }
                    if failures.len() >= max_attempts {
                        tracing::warn!(operation = id, attempts = failures.len(), "retry exhausted");
                        break 'retry_loop Err(ResilienceError::RetryExhausted {
                            attempts: failures.len(),
                            failures,
                        });
                    }

                    let error_rate = self.error_rate(id).await;
                    let load_factor = self.active_retries.load(Ordering::Acquire);
                    let delay = strategy.delay_ms(attempt, error_rate, load_factor);
                    let delay = RetryStrategy::apply_jitter(delay, DEFAULT_JITTER_RANGE);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        };

        self.active_retries.fetch_sub(1, Ordering::AcqRel);
        self.cancellations.lock().await.remove(id);
        result
    }

    /// Defers the first attempt by `initial_delay_ms`, then behaves exactly
    /// like `execute_with_retry`. Returns immediately is not modeled here
    /// since the engine is always awaited by its caller; the defer is the
    /// only distinguishing behavior from an immediate retry loop.
    pub async fn schedule_retry<T, E, Fut, Op>(
        &self,
        id: &str,
        strategy: &RetryStrategy,
        max_attempts: usize,
        initial_delay_ms: u64,
        should_retry: impl Fn(&E) -> bool,
        op: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        E: std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        tokio::time::sleep(Duration::from_millis(initial_delay_ms)).await;
        self.execute_with_retry(id, strategy, max_attempts, should_retry, op)
            .await
    }

    async fn record_outcome(&self, id: &str, failed: bool) {
        self.error_histories
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .record(failed);
    }

    async fn error_rate(&self, id: &str) -> f64 {
        self.error_histories
            .lock()
            .await
            .get(id)
            .map(|h| h.error_rate())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[derive(Debug)]
    enum TestError {
        Boom,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let engine = ResilienceEngine::new(CircuitBreakerConfig::default());
        let calls = Arc::new(StdAtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result: Result<u32, ResilienceError<TestError>> = engine
            .execute_with_retry(
                "op-a",
                &RetryStrategy::Fixed { base_delay_ms: 1 },
                5,
                |_| true,
                move || {
                    let calls = calls_clone.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            Err(TestError::Boom)
                        } else {
                            Ok(42)
                        }
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let engine = ResilienceEngine::new(CircuitBreakerConfig::default());
        let result: Result<u32, ResilienceError<TestError>> = engine
            .execute_with_retry(
                "op-b",
                &RetryStrategy::Fixed { base_delay_ms: 1 },
                3,
                |_| true,
                || async { Err(TestError::Boom) },
            )
            .await;

        match result {
            Err(ResilienceError::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let engine = ResilienceEngine::new(CircuitBreakerConfig::default());
        let calls = Arc::new(StdAtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result: Result<u32, ResilienceError<TestError>> = engine
            .execute_with_retry(
                "op-c",
                &RetryStrategy::Fixed { base_delay_ms: 1 },
                5,
                |_| false,
                move || {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(TestError::Boom)
                    }
                },
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::Inner(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
