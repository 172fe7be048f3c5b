use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{info_span, Instrument};

use axonpuls_helpers::time::Clock;

/// Tracks message ids already processed locally so a re-delivered frame
/// (retransmit, or a node subscribed to the same channel twice during a
/// rolling deploy) is routed to local sockets only once. Bounded by TTL,
/// not by size: entries are swept once they outlive `ttl`.
pub struct DedupeCache {
    seen: Mutex<HashMap<String, u64>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl DedupeCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        DedupeCache {
            seen: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Records `message_id` as seen and reports whether it was already
    /// present, i.e. whether this delivery is a duplicate.
    pub async fn check_and_insert(&self, message_id: &str) -> bool {
        let mut seen = self.seen.lock().await;
        let now = self.clock.now_unix_secs();
        if let Some(seen_at) = seen.get(message_id) {
            if now.saturating_sub(*seen_at) <= self.ttl.as_secs() {
                return true;
            }
        }
        seen.insert(message_id.to_string(), now);
        false
    }

    pub async fn sweep_expired(&self) {
        let now = self.clock.now_unix_secs();
        let ttl_secs = self.ttl.as_secs();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, seen_at| now.saturating_sub(*seen_at) <= ttl_secs);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }
}

/// Periodically sweeps expired dedupe entries so the cache does not grow
/// unbounded under sustained traffic.
pub fn spawn_gc_task(cache: Arc<DedupeCache>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                cache.sweep_expired().await;
            }
        }
        .instrument(info_span!("router_dedupe_gc")),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    struct ManualClock {
        secs: AtomicU64,
    }

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(ManualClock {
                secs: AtomicU64::new(1_000),
            })
        }

        fn advance(&self, secs: u64) {
            self.secs.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_unix_secs(&self) -> u64 {
            self.secs.load(Ordering::SeqCst)
        }

        fn now_instant(&self) -> std::time::Instant {
            std::time::Instant::now()
        }
    }

    #[tokio::test]
    async fn second_delivery_of_same_id_is_duplicate_s2() {
        let clock = ManualClock::new();
        let cache = DedupeCache::new(Duration::from_secs(60), clock);

        assert!(!cache.check_and_insert("msg-1").await);
        assert!(cache.check_and_insert("msg-1").await);
        assert!(!cache.check_and_insert("msg-2").await);
    }

    #[tokio::test]
    async fn expired_entries_are_forgotten() {
        let clock = ManualClock::new();
        let cache = DedupeCache::new(Duration::from_secs(30), clock.clone());

        assert!(!cache.check_and_insert("msg-1").await);
        clock.advance(31);
        assert!(!cache.check_and_insert("msg-1").await);
    }

    #[tokio::test]
    async fn sweep_removes_expired_entries() {
        let clock = ManualClock::new();
        let cache = Arc::new(DedupeCache::new(Duration::from_secs(10), clock.clone()));

        cache.check_and_insert("msg-1").await;
        cache.check_and_insert("msg-2").await;
        assert_eq!(cache.len().await, 2);

        clock.advance(11);
        cache.sweep_expired().await;
        assert_eq!(cache.len().await, 0);
    }
}
