use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A clock that can provide the current time as a UNIX timestamp in
/// seconds, and a monotonic instant for measuring elapsed durations.
///
/// Injected into every component that needs to reason about time so that
/// tests can substitute a deterministic fake instead of sleeping.
pub trait Clock: Send + Sync {
    fn now_unix_secs(&self) -> u64;
    fn now_instant(&self) -> Instant;
}

/// A default implementation of a clock that uses the system time.
///
/// # Examples
///
/// ```
/// # use axonpuls_helpers::time::DefaultClock;
///
/// let clock = DefaultClock::new();
/// let now = clock.now_unix_secs();
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClock {}

impl DefaultClock {
    /// Creates a new instance of the default clock that uses system time.
    pub fn new() -> Self {
        DefaultClock {}
    }
}

impl Clock for DefaultClock {
    fn now_unix_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_secs()
    }

    fn now_instant(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_clock_now_is_plausible() {
        let clock = DefaultClock::new();
        assert!(clock.now_unix_secs() > 1_700_000_000);
    }
}
