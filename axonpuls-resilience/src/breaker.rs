use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axonpuls_helpers::time::Clock;

use crate::errors::ResilienceError;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-breaker configuration; one breaker is lazily created per named
/// operation id the first time it is used.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub timeout: Duration,
    pub half_open_max_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            timeout: Duration::from_secs(10),
            half_open_max_calls: 1,
        }
    }
}

struct State {
    inner: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
}

/// A single named circuit breaker. State transitions follow the closed ->
/// open -> half_open -> {closed, open} machine: `closed -> open` when
/// `failure_count >= threshold`; `open -> half_open` once `timeout` has
/// elapsed since opening; `half_open` closes on success and reopens
/// (resetting the timeout) on any failure.
pub struct CircuitBreaker {
    id: String,
    state: Arc<State>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    started_at: std::time::Instant,
}

impl CircuitBreaker {
    pub fn new(id: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now_instant();
        CircuitBreaker {
            id: id.into(),
            state: Arc::new(State {
                inner: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                half_open_calls: AtomicUsize::new(0),
            }),
            config,
            clock,
            started_at,
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.inner.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_instant().duration_since(self.started_at).as_millis() as u64
    }

    /// Checks whether a call may proceed, performing any due `open ->
    /// half_open` transition. Returns an error describing why the call
    /// should fail fast, or `Ok(())` to proceed.
    pub fn check<E>(&self) -> Result<(), ResilienceError<E>> {
        loop {
            match self.state.inner.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.now_millis().saturating_sub(opened_at);
                    if elapsed >= self.config.timeout.as_millis() as u64 {
                        match self.state.inner.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!(breaker = %self.id, "circuit breaker -> half_open");
                                self.state.half_open_calls.store(1, Ordering::Release);
                                return Ok(());
                            }
                            Err(STATE_HALF_OPEN) => continue,
                            Err(STATE_CLOSED) => return Ok(()),
                            Err(_) => unreachable!("invalid breaker state"),
                        }
                    }
                    return Err(ResilienceError::CircuitOpen {
                        failure_count: self.state.failure_count.load(Ordering::Acquire),
                        open_duration: Duration::from_millis(elapsed),
                    });
                }
                STATE_HALF_OPEN => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: self.state.failure_count.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(0),
                        });
                    }
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    pub fn on_success(&self) {
        let current = self.state.inner.load(Ordering::Acquire);
        if current == STATE_HALF_OPEN {
            self.state.half_open_calls.fetch_sub(1, Ordering::AcqRel);
            if self
                .state
                .inner
                .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.state.failure_count.store(0, Ordering::Release);
                self.state.opened_at_millis.store(0, Ordering::Release);
                tracing::info!(breaker = %self.id, "circuit breaker -> closed");
            }
        } else if current == STATE_CLOSED {
            self.state.failure_count.store(0, Ordering::Release);
        }
    }

    pub fn on_failure(&self) {
        let current = self.state.inner.load(Ordering::Acquire);
        if current == STATE_HALF_OPEN {
            self.state.half_open_calls.fetch_sub(1, Ordering::AcqRel);
            if self
                .state
                .inner
                .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                tracing::warn!(breaker = %self.id, "circuit breaker half_open probe failed -> open");
            }
            return;
        }

        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        if current == STATE_CLOSED && failures >= self.config.failure_threshold {
            if self
                .state
                .inner
                .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                tracing::warn!(breaker = %self.id, failures, "circuit breaker -> open");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;
    use std::time::Instant;

    #[derive(Debug)]
    struct ManualClock {
        start: Instant,
        offset_millis: StdAtomicU64,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(ManualClock {
                start: Instant::now(),
                offset_millis: StdAtomicU64::new(0),
            })
        }

        fn advance(&self, millis: u64) {
            self.offset_millis.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_unix_secs(&self) -> u64 {
            0
        }

        fn now_instant(&self) -> Instant {
            self.start + Duration::from_millis(self.offset_millis.load(Ordering::SeqCst))
        }
    }

    fn breaker(clock: Arc<dyn Clock>) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 3,
                timeout: Duration::from_secs(10),
                half_open_max_calls: 1,
            },
            clock,
        )
    }

    #[test]
    fn starts_closed() {
        let clock = ManualClock::new();
        let b = breaker(clock);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_after_threshold_failures_s6() {
        let clock = ManualClock::new();
        let b = breaker(clock.clone());
        b.check::<()>().unwrap();
        b.on_failure();
        b.check::<()>().unwrap();
        b.on_failure();
        b.check::<()>().unwrap();
        b.on_failure();
        assert_eq!(b.state(), CircuitState::Open);

        // A 4th call within the timeout fails fast.
        assert!(matches!(
            b.check::<()>(),
            Err(ResilienceError::CircuitOpen { .. })
        ));

        // At t=10s the breaker allows a half-open probe.
        clock.advance(10_000);
        assert!(b.check::<()>().is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.on_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let clock = ManualClock::new();
        let b = breaker(clock.clone());
        for _ in 0..3 {
            b.check::<()>().unwrap();
            b.on_failure();
        }
        clock.advance(10_000);
        b.check::<()>().unwrap();
        b.on_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_limits_concurrent_calls() {
        let clock = ManualClock::new();
        let b = breaker(clock.clone());
        for _ in 0..3 {
            b.check::<()>().unwrap();
            b.on_failure();
        }
        clock.advance(10_000);
        b.check::<()>().unwrap();
        assert!(matches!(
            b.check::<()>(),
            Err(ResilienceError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn success_in_closed_state_resets_failure_count() {
        let clock = ManualClock::new();
        let b = breaker(clock);
        b.check::<()>().unwrap();
        b.on_failure();
        b.check::<()>().unwrap();
        b.on_success();
        assert_eq!(b.failure_count(), 0);
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
