use std::collections::HashSet;
use std::fmt::Debug;

use redis::{
    aio::MultiplexedConnection, cluster::ClusterClientBuilder, cluster_async::ClusterConnection,
    AsyncCommands, Client, FromRedisValue, Pipeline, PushInfo, RedisResult, ToRedisArgs,
};
use tokio::sync::mpsc::UnboundedSender;

/// Configuration for a Redis connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// The nodes to use to connect to the Redis cluster or instance.
    pub nodes: Vec<String>,
    /// The password to use to connect to the Redis cluster or instance.
    pub password: Option<String>,
    /// Whether to use cluster mode for the Redis connection.
    pub cluster_mode: bool,
}

/// A wrapper around a Redis connection that can be used to
/// get a connection to a Redis cluster or instance.
/// This provides a unified interface for both single node and cluster mode
/// connections for the subset of Redis commands used by the fabric.
pub enum ConnectionWrapper {
    Cluster(ClusterConnection),
    SingleNode(MultiplexedConnection),
}

impl Debug for ConnectionWrapper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConnectionWrapper::Cluster(_) => write!(f, "ConnectionWrapper::Cluster"),
            ConnectionWrapper::SingleNode(_) => write!(f, "ConnectionWrapper::SingleNode"),
        }
    }
}

impl Clone for ConnectionWrapper {
    fn clone(&self) -> Self {
        match self {
            ConnectionWrapper::Cluster(conn) => ConnectionWrapper::Cluster(conn.clone()),
            ConnectionWrapper::SingleNode(conn) => ConnectionWrapper::SingleNode(conn.clone()),
        }
    }
}

impl ConnectionWrapper {
    /// Gets the value at `key`, or an empty string if the key is absent.
    /// [Redis Docs](https://redis.io/commands/GET)
    pub async fn get(&mut self, key: &str) -> RedisResult<Option<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.get(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.get(key).await,
        }
    }

    /// Sets the value and expiration of a key, in milliseconds.
    /// [Redis Docs](https://redis.io/commands/SET)
    pub async fn set_ex(&mut self, key: &str, value: &str, expire_ms: u64) -> RedisResult<bool> {
        let result: Option<String> = match self {
            ConnectionWrapper::Cluster(conn) => conn.pset_ex(key, value, expire_ms).await?,
            ConnectionWrapper::SingleNode(conn) => conn.pset_ex(key, value, expire_ms).await?,
        };
        Ok(result.is_some())
    }

    /// Sets the value and expiration of a key, in milliseconds, only if the
    /// key does not already exist. Maps to `SET key value NX PX expire_ms`.
    ///
    /// Returns `true` if the key was set, `false` if it already existed.
    pub async fn set_nx_ex(&mut self, key: &str, value: &str, expire_ms: u64) -> RedisResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(expire_ms);

        let result: Option<String> = match self {
            ConnectionWrapper::Cluster(conn) => cmd.query_async(conn).await?,
            ConnectionWrapper::SingleNode(conn) => cmd.query_async(conn).await?,
        };
        Ok(result.is_some())
    }

    /// Refreshes the TTL on an existing key, in seconds.
    /// [Redis Docs](https://redis.io/commands/EXPIRE)
    pub async fn expire(&mut self, key: &str, ttl_secs: i64) -> RedisResult<bool> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.expire(key, ttl_secs).await,
            ConnectionWrapper::SingleNode(conn) => conn.expire(key, ttl_secs).await,
        }
    }

    /// Deletes one or more keys. Idempotent; deleting an absent key is a no-op.
    /// [Redis Docs](https://redis.io/commands/DEL)
    pub async fn del(&mut self, keys: &[&str]) -> RedisResult<u64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.del(keys).await,
            ConnectionWrapper::SingleNode(conn) => conn.del(keys).await,
        }
    }

    /// Adds a member to a set.
    /// [Redis Docs](https://redis.io/commands/SADD)
    pub async fn sadd(&mut self, key: &str, member: &str) -> RedisResult<u64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.sadd(key, member).await,
            ConnectionWrapper::SingleNode(conn) => conn.sadd(key, member).await,
        }
    }

    /// Removes a member from a set.
    /// [Redis Docs](https://redis.io/commands/SREM)
    pub async fn srem(&mut self, key: &str, member: &str) -> RedisResult<u64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.srem(key, member).await,
            ConnectionWrapper::SingleNode(conn) => conn.srem(key, member).await,
        }
    }

    /// Returns every member of a set.
    /// [Redis Docs](https://redis.io/commands/SMEMBERS)
    pub async fn smembers(&mut self, key: &str) -> RedisResult<HashSet<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.smembers(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.smembers(key).await,
        }
    }

    /// Evaluates a Lua script against the given keys and arguments.
    /// [Redis Docs](https://redis.io/commands/EVAL)
    pub async fn eval_script<T: Default + FromRedisValue>(
        &mut self,
        script: &str,
        keys: &[&str],
        args: &[&str],
    ) -> RedisResult<T> {
        if keys.is_empty() {
            return Ok(T::default());
        }

        let script_obj = redis::Script::new(script);
        let mut script_invocation = &mut script_obj.key(keys[0]);
        for key in keys.iter().skip(1) {
            script_invocation = script_invocation.key(key);
        }
        for arg in args {
            script_invocation = script_invocation.arg(arg);
        }

        match self {
            ConnectionWrapper::Cluster(conn) => script_invocation.invoke_async(conn).await,
            ConnectionWrapper::SingleNode(conn) => script_invocation.invoke_async(conn).await,
        }
    }

    /// Executes a pipeline of commands asynchronously.
    /// [Redis Docs](https://redis.io/docs/latest/reference/pipelining/)
    pub async fn query_pipeline_async(
        &mut self,
        pipeline: &mut Pipeline,
    ) -> RedisResult<Vec<Option<String>>> {
        match self {
            ConnectionWrapper::Cluster(conn) => pipeline.query_async(conn).await,
            ConnectionWrapper::SingleNode(conn) => pipeline.query_async(conn).await,
        }
    }

    /// Subscribes to a channel. Pushes arrive on the push sender configured
    /// when the connection was opened.
    ///
    /// Only available over the RESP3 protocol; returns an error otherwise.
    pub async fn subscribe(&mut self, channel_name: &str) -> RedisResult<()> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.subscribe(channel_name).await,
            ConnectionWrapper::SingleNode(conn) => conn.subscribe(channel_name).await,
        }
    }

    /// Publishes a message to a channel.
    /// [Redis Docs](https://redis.io/commands/PUBLISH)
    pub async fn publish(&mut self, channel_name: &str, message: String) -> RedisResult<i32> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.publish(channel_name, message).await,
            ConnectionWrapper::SingleNode(conn) => conn.publish(channel_name, message).await,
        }
    }

    /// Pings the server; used by the health surface's Redis probe.
    /// [Redis Docs](https://redis.io/commands/PING)
    pub async fn ping(&mut self) -> RedisResult<String> {
        let mut cmd = redis::cmd("PING");
        match self {
            ConnectionWrapper::Cluster(conn) => cmd.query_async(conn).await,
            ConnectionWrapper::SingleNode(conn) => cmd.query_async(conn).await,
        }
    }
}

/// Creates a connection to a Redis cluster or instance.
///
/// If a `redis_tx` is provided, the connection will be configured to push
/// pub/sub messages to it as `PushInfo` values, which is how the
/// subscriber side of the router receives published frames.
pub async fn get_redis_connection(
    conn_config: &ConnectionConfig,
    redis_tx: Option<UnboundedSender<PushInfo>>,
) -> RedisResult<ConnectionWrapper> {
    if !conn_config.cluster_mode {
        let client = Client::open(conn_config.nodes[0].clone())?;
        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(redis_tx) = redis_tx {
            config = config.set_push_sender(redis_tx);
        }
        return Ok(ConnectionWrapper::SingleNode(
            client
                .get_multiplexed_async_connection_with_config(&config)
                .await?,
        ));
    }

    let mut builder = ClusterClientBuilder::new(conn_config.nodes.clone())
        .use_protocol(redis::ProtocolVersion::RESP3);

    if let Some(password) = conn_config.password.clone() {
        builder = builder.password(password);
    }

    let client = if let Some(redis_tx) = redis_tx {
        builder.push_sender(redis_tx).build()?
    } else {
        builder.build()?
    };

    Ok(ConnectionWrapper::Cluster(
        client.get_async_connection().await?,
    ))
}
