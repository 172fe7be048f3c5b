use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use redis::{PushInfo, RedisResult};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::redis::{get_redis_connection, ConnectionConfig, ConnectionWrapper};

/// Typed access to the subset of Redis used by the fabric: KV with TTL,
/// sets, and PUBLISH/SUBSCRIBE. Every key passed to these methods is
/// expected to already carry the application prefix (§6.1) — the gateway
/// does not namespace keys itself; callers build keys through a shared
/// `KeyScheme` (see the crate that owns the Redis key layout) so the
/// prefix is applied in exactly one place.
#[async_trait]
pub trait RedisGateway: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> RedisResult<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl_ms: u64) -> RedisResult<bool>;
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_ms: u64) -> RedisResult<bool>;
    async fn expire(&self, key: &str, ttl_secs: i64) -> RedisResult<bool>;
    async fn del(&self, key: &str) -> RedisResult<u64>;
    async fn sadd(&self, key: &str, member: &str) -> RedisResult<u64>;
    async fn srem(&self, key: &str, member: &str) -> RedisResult<u64>;
    async fn smembers(&self, key: &str) -> RedisResult<HashSet<String>>;
    async fn publish(&self, channel: &str, message: String) -> RedisResult<i32>;
    async fn ping(&self) -> RedisResult<()>;
}

/// A `RedisGateway` backed by a real Redis connection (single-node or
/// cluster, per `ConnectionConfig`).
pub struct RealRedisGateway {
    conn: tokio::sync::Mutex<ConnectionWrapper>,
}

impl fmt::Debug for RealRedisGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RealRedisGateway")
    }
}

impl RealRedisGateway {
    pub async fn connect(conn_config: &ConnectionConfig) -> RedisResult<Self> {
        let conn = get_redis_connection(conn_config, None).await?;
        Ok(RealRedisGateway {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// Connects with a push sender attached, returning the raw push
    /// receiver for a subscriber loop to drain. Used by the router's
    /// pub/sub transport, which needs direct access to `PushInfo` frames.
    pub async fn connect_with_push(
        conn_config: &ConnectionConfig,
    ) -> RedisResult<(Self, UnboundedReceiver<PushInfo>)> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = get_redis_connection(conn_config, Some(tx)).await?;
        Ok((
            RealRedisGateway {
                conn: tokio::sync::Mutex::new(conn),
            },
            rx,
        ))
    }
}

#[async_trait]
impl RedisGateway for RealRedisGateway {
    async fn get(&self, key: &str) -> RedisResult<Option<String>> {
        self.conn.lock().await.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_ms: u64) -> RedisResult<bool> {
        self.conn.lock().await.set_ex(key, value, ttl_ms).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_ms: u64) -> RedisResult<bool> {
        self.conn.lock().await.set_nx_ex(key, value, ttl_ms).await
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> RedisResult<bool> {
        self.conn.lock().await.expire(key, ttl_secs).await
    }

    async fn del(&self, key: &str) -> RedisResult<u64> {
        self.conn.lock().await.del(&[key]).await
    }

    async fn sadd(&self, key: &str, member: &str) -> RedisResult<u64> {
        self.conn.lock().await.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> RedisResult<u64> {
        self.conn.lock().await.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> RedisResult<HashSet<String>> {
        self.conn.lock().await.smembers(key).await
    }

    async fn publish(&self, channel: &str, message: String) -> RedisResult<i32> {
        self.conn.lock().await.publish(channel, message).await
    }

    async fn ping(&self) -> RedisResult<()> {
        self.conn.lock().await.ping().await.map(|_| ())
    }
}

/// A key prefix applied uniformly to every Redis key the fabric touches
/// (§6.1). Deployment-configurable; defaults to `axonpuls:`.
#[derive(Debug, Clone)]
pub struct KeyScheme {
    prefix: String,
}

impl Default for KeyScheme {
    fn default() -> Self {
        KeyScheme {
            prefix: "axonpuls:".to_string(),
        }
    }
}

impl KeyScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        KeyScheme { prefix: prefix.into() }
    }

    pub fn key(&self, rest: &str) -> String {
        format!("{}{}", self.prefix, rest)
    }
}
