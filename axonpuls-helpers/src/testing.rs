//! In-memory test doubles shared across the workspace's crates so that
//! registry/connection-manager/router logic can be exercised without a
//! live Redis server.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::RedisResult;
use tokio::sync::Mutex;

use crate::gateway::RedisGateway;

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// Shared backing store for one or more `FakeRedisGateway` handles,
/// simulating a single Redis deployment observed by multiple cluster
/// nodes.
#[derive(Default)]
pub struct FakeRedisCluster {
    kv: Mutex<HashMap<String, Entry>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
}

impl FakeRedisCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeRedisCluster::default())
    }

    fn is_live(entry: &Entry) -> bool {
        entry.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

/// A `RedisGateway` backed by an in-memory `FakeRedisCluster`. Multiple
/// handles over the same cluster behave like multiple nodes sharing one
/// Redis deployment.
#[derive(Clone)]
pub struct FakeRedisGateway {
    cluster: Arc<FakeRedisCluster>,
}

impl std::fmt::Debug for FakeRedisGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FakeRedisGateway")
    }
}

impl FakeRedisGateway {
    pub fn new(cluster: Arc<FakeRedisCluster>) -> Self {
        FakeRedisGateway { cluster }
    }
}

#[async_trait]
impl RedisGateway for FakeRedisGateway {
    async fn get(&self, key: &str) -> RedisResult<Option<String>> {
        let kv = self.cluster.kv.lock().await;
        Ok(kv
            .get(key)
            .filter(|e| FakeRedisCluster::is_live(e))
            .map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_ms: u64) -> RedisResult<bool> {
        let mut kv = self.cluster.kv.lock().await;
        kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_millis(ttl_ms)),
            },
        );
        Ok(true)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_ms: u64) -> RedisResult<bool> {
        let mut kv = self.cluster.kv.lock().await;
        let occupied = kv.get(key).map(FakeRedisCluster::is_live).unwrap_or(false);
        if occupied {
            return Ok(false);
        }
        kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_millis(ttl_ms)),
            },
        );
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> RedisResult<bool> {
        let mut kv = self.cluster.kv.lock().await;
        if let Some(entry) = kv.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs.max(0) as u64));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn del(&self, key: &str) -> RedisResult<u64> {
        let mut kv = self.cluster.kv.lock().await;
        Ok(if kv.remove(key).is_some() { 1 } else { 0 })
    }

    async fn sadd(&self, key: &str, member: &str) -> RedisResult<u64> {
        let mut sets = self.cluster.sets.lock().await;
        let set = sets.entry(key.to_string()).or_default();
        Ok(if set.insert(member.to_string()) { 1 } else { 0 })
    }

    async fn srem(&self, key: &str, member: &str) -> RedisResult<u64> {
        let mut sets = self.cluster.sets.lock().await;
        if let Some(set) = sets.get_mut(key) {
            Ok(if set.remove(member) { 1 } else { 0 })
        } else {
            Ok(0)
        }
    }

    async fn smembers(&self, key: &str) -> RedisResult<HashSet<String>> {
        let sets = self.cluster.sets.lock().await;
        Ok(sets.get(key).cloned().unwrap_or_default())
    }

    async fn publish(&self, _channel: &str, _message: String) -> RedisResult<i32> {
        // Pub/sub for tests is modeled separately by the router's
        // in-memory transport; the KV-oriented gateway fake is a no-op
        // publisher so components that call through it in isolation
        // (outside router tests) don't need a live subscriber.
        Ok(0)
    }

    async fn ping(&self) -> RedisResult<()> {
        Ok(())
    }
}
