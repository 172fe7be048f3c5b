use std::fmt;
use std::time::Duration;

/// Errors surfaced by the retry and circuit-breaker engine.
///
/// `Inner` wraps whatever error the guarded operation produced; the other
/// variants are produced by the engine itself and are never retried by a
/// caller that already went through `execute_with_retry`.
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// The guarded operation failed; `E` is the caller's error type.
    Inner(E),
    /// The retry budget was exhausted without a success.
    RetryExhausted {
        attempts: usize,
        failures: Vec<String>,
    },
    /// The circuit breaker is open (or its half-open slot is full) and the
    /// call was failed fast without invoking the operation.
    CircuitOpen {
        failure_count: usize,
        open_duration: Duration,
    },
    /// The named retry operation was cancelled before it completed.
    Cancelled,
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResilienceError::Inner(e) => write!(f, "operation failed: {e}"),
            ResilienceError::RetryExhausted { attempts, failures } => write!(
                f,
                "retry exhausted after {attempts} attempts, last errors: {}",
                failures.join("; ")
            ),
            ResilienceError::CircuitOpen {
                failure_count,
                open_duration,
            } => write!(
                f,
                "circuit open (failure_count={failure_count}, open for {open_duration:?})"
            ),
            ResilienceError::Cancelled => write!(f, "retry operation cancelled"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ResilienceError<E> {}

impl<E> ResilienceError<E> {
    /// Non-retryable errors (capacity, cancellation) should never re-enter
    /// a caller's own retry loop; only `Inner` errors are subject to the
    /// caller-supplied `should_retry` predicate.
    pub fn is_retryable_kind(&self) -> bool {
        matches!(self, ResilienceError::Inner(_))
    }
}
