use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use axonpuls_helpers::gateway::{KeyScheme, RedisGateway};
use axonpuls_helpers::time::Clock;

use crate::errors::RegistryError;
use crate::types::{Node, NodeMetrics, NodeMetricsDelta, NodeStatus};

const SERVERS_INDEX_KEY: &str = "servers:index";

#[derive(Debug, Clone)]
pub struct ServerRegistryConfig {
    pub node_id: String,
    pub address: String,
    pub version: String,
    pub region: String,
    pub capacity: u64,
    pub heartbeat_period: Duration,
    pub heartbeat_ttl: Duration,
}

/// Maintains this node's own membership entry (§4.D) and answers
/// cluster-membership queries on behalf of the manager and router.
pub struct ServerRegistry {
    gateway: Arc<dyn RedisGateway>,
    keys: KeyScheme,
    clock: Arc<dyn Clock>,
    config: ServerRegistryConfig,
    metrics: Mutex<NodeMetrics>,
    status: Mutex<NodeStatus>,
}

impl ServerRegistry {
    pub fn new(
        gateway: Arc<dyn RedisGateway>,
        keys: KeyScheme,
        clock: Arc<dyn Clock>,
        config: ServerRegistryConfig,
    ) -> Self {
        ServerRegistry {
            gateway,
            keys,
            clock,
            config,
            metrics: Mutex::new(NodeMetrics::default()),
            status: Mutex::new(NodeStatus::Active),
        }
    }

    fn server_key(&self, node_id: &str) -> String {
        self.keys.key(&format!("servers:{node_id}"))
    }

    fn index_key(&self) -> String {
        self.keys.key(SERVERS_INDEX_KEY)
    }

    async fn current_record(&self) -> Node {
        Node {
            node_id: self.config.node_id.clone(),
            address: self.config.address.clone(),
            version: self.config.version.clone(),
            region: self.config.region.clone(),
            capacity: self.config.capacity,
            status: *self.status.lock().await,
            metrics: self.metrics.lock().await.clone(),
            heartbeat_at: self.clock.now_unix_secs(),
        }
    }

    /// Writes `servers:{id}` with a TTL of `heartbeat_ttl` and adds this
    /// node to `servers:index`. Called once at process start.
    pub async fn register(&self) -> Result<(), RegistryError> {
        let record = self.current_record().await;
        let payload = serde_json::to_string(&record)?;
        self.gateway
            .set_ex(
                &self.server_key(&record.node_id),
                &payload,
                self.config.heartbeat_ttl.as_millis() as u64,
            )
            .await?;
        self.gateway
            .sadd(&self.index_key(), &record.node_id)
            .await?;
        tracing::info!(node_id = %record.node_id, "server registered");
        Ok(())
    }

    /// Refreshes the record and its TTL; called every `heartbeat_period`.
    pub async fn heartbeat(&self) -> Result<(), RegistryError> {
        self.register().await
    }

    /// Merges metric deltas into the in-memory snapshot that the next
    /// heartbeat will publish. Per the open question on connection
    /// counting, this tracks a running counter rather than re-enumerating
    /// keys on every change; the externally observable value is accurate
    /// within one `CLEANUP_INTERVAL` as required.
    pub async fn update_metrics(&self, delta: NodeMetricsDelta) {
        self.metrics.lock().await.merge(&delta);
    }

    /// Reads the index, hydrates every member, and returns only nodes
    /// whose record is still present (TTL not expired) and whose status
    /// is `active` or `draining`.
    pub async fn get_active_servers(&self) -> Result<Vec<Node>, RegistryError> {
        let ids = self.gateway.smembers(&self.index_key()).await?;
        let mut servers = Vec::new();
        for id in ids {
            match self.get_server_by_id(&id).await {
                Ok(Some(node)) if node.is_routable() => servers.push(node),
                Ok(_) => {}
                Err(err) => tracing::warn!(node_id = %id, error = %err, "failed to hydrate server record"),
            }
        }
        Ok(servers)
    }

    pub async fn get_server_by_id(&self, node_id: &str) -> Result<Option<Node>, RegistryError> {
        match self.gateway.get(&self.server_key(node_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_draining(&self) -> Result<(), RegistryError> {
        *self.status.lock().await = NodeStatus::Draining;
        self.register().await
    }

    /// Used by graceful shutdown: deletes the server key and removes the
    /// node from the index.
    pub async fn unregister(&self) -> Result<(), RegistryError> {
        self.gateway
            .del(&self.server_key(&self.config.node_id))
            .await?;
        self.gateway
            .srem(&self.index_key(), &self.config.node_id)
            .await?;
        tracing::info!(node_id = %self.config.node_id, "server unregistered");
        Ok(())
    }

    pub fn heartbeat_period(&self) -> Duration {
        self.config.heartbeat_period
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }
}

/// Spawns the long-lived heartbeat task described in §5: refreshes the
/// registry entry every `heartbeat_period` until the process shuts down.
/// A missed tick (Redis transiently unavailable) is logged and retried on
/// the next tick rather than torn down, per §4.D's failure semantics.
pub fn spawn_heartbeat_task(registry: Arc<ServerRegistry>) -> tokio::task::JoinHandle<()> {
    let period = registry.heartbeat_period();
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(err) = registry.heartbeat().await {
                    tracing::warn!(error = %err, "heartbeat failed, will retry next tick");
                }
            }
        }
        .instrument(tracing::info_span!("registry_heartbeat")),
    )
}

use tracing::Instrument;

#[cfg(test)]
mod tests {
    use super::*;
    use axonpuls_helpers::testing::{FakeRedisCluster, FakeRedisGateway};
    use axonpuls_helpers::time::DefaultClock;

    fn config(node_id: &str) -> ServerRegistryConfig {
        ServerRegistryConfig {
            node_id: node_id.to_string(),
            address: "127.0.0.1:9000".to_string(),
            version: "1.0.0".to_string(),
            region: "local".to_string(),
            capacity: 1000,
            heartbeat_period: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn register_then_visible_in_active_servers() {
        let cluster = FakeRedisCluster::new();
        let gw: Arc<dyn RedisGateway> = Arc::new(FakeRedisGateway::new(cluster));
        let registry = ServerRegistry::new(
            gw,
            KeyScheme::default(),
            Arc::new(DefaultClock::new()),
            config("n1"),
        );

        registry.register().await.unwrap();
        let active = registry.get_active_servers().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].node_id, "n1");
        assert_eq!(active[0].status, NodeStatus::Active);
    }

    #[tokio::test]
    async fn draining_nodes_remain_active_servers() {
        let cluster = FakeRedisCluster::new();
        let gw: Arc<dyn RedisGateway> = Arc::new(FakeRedisGateway::new(cluster));
        let registry = ServerRegistry::new(
            gw,
            KeyScheme::default(),
            Arc::new(DefaultClock::new()),
            config("n1"),
        );
        registry.register().await.unwrap();
        registry.set_draining().await.unwrap();

        let active = registry.get_active_servers().await.unwrap();
        assert_eq!(active[0].status, NodeStatus::Draining);
    }

    #[tokio::test]
    async fn unregister_removes_from_index() {
        let cluster = FakeRedisCluster::new();
        let gw: Arc<dyn RedisGateway> = Arc::new(FakeRedisGateway::new(cluster));
        let registry = ServerRegistry::new(
            gw,
            KeyScheme::default(),
            Arc::new(DefaultClock::new()),
            config("n1"),
        );
        registry.register().await.unwrap();
        registry.unregister().await.unwrap();
        assert!(registry.get_active_servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_metrics_reflected_on_next_heartbeat() {
        let cluster = FakeRedisCluster::new();
        let gw: Arc<dyn RedisGateway> = Arc::new(FakeRedisGateway::new(cluster));
        let registry = ServerRegistry::new(
            gw,
            KeyScheme::default(),
            Arc::new(DefaultClock::new()),
            config("n1"),
        );
        registry.register().await.unwrap();
        registry
            .update_metrics(NodeMetricsDelta {
                connections_delta: Some(5),
                ..Default::default()
            })
            .await;
        registry.heartbeat().await.unwrap();

        let node = registry.get_server_by_id("n1").await.unwrap().unwrap();
        assert_eq!(node.metrics.connections, 5);
    }
}
