use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use axonpuls_helpers::gateway::{KeyScheme, RedisGateway};
use axonpuls_helpers::time::Clock;
use axonpuls_registry::ServerRegistry;

use crate::errors::ConnectionManagerError;
use crate::migration::MigrationSignal;
use crate::types::{LoadMetric, MigrationRecord, MigrationStatus, Session, SessionStatus};

#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    pub connection_ttl: Duration,
    pub cleanup_interval: Duration,
    pub load_balance_interval: Duration,
    pub load_balance_threshold: f64,
    pub migration_ttl: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        ConnectionManagerConfig {
            connection_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_millis(60_000),
            load_balance_interval: Duration::from_secs(300),
            load_balance_threshold: 0.8,
            migration_ttl: Duration::from_secs(300),
        }
    }
}

/// Cluster-wide index of open WebSocket sessions (§4.E). Owns no sockets
/// itself — it is a typed view over the Redis key scheme in §6.1, plus
/// the two background sweepers (stale cleanup, load balancing).
pub struct ConnectionManager {
    gateway: Arc<dyn RedisGateway>,
    keys: KeyScheme,
    clock: Arc<dyn Clock>,
    registry: Arc<ServerRegistry>,
    migration_signal: Arc<dyn MigrationSignal>,
    config: ConnectionManagerConfig,
}

impl ConnectionManager {
    pub fn new(
        gateway: Arc<dyn RedisGateway>,
        keys: KeyScheme,
        clock: Arc<dyn Clock>,
        registry: Arc<ServerRegistry>,
        migration_signal: Arc<dyn MigrationSignal>,
        config: ConnectionManagerConfig,
    ) -> Self {
        ConnectionManager {
            gateway,
            keys,
            clock,
            registry,
            migration_signal,
            config,
        }
    }

    fn connection_key(&self, sid: &str) -> String {
        self.keys.key(&format!("connections:{sid}"))
    }

    fn server_connections_key(&self, node: &str) -> String {
        self.keys.key(&format!("server-connections:{node}"))
    }

    fn org_connections_key(&self, org: &str) -> String {
        self.keys.key(&format!("org-connections:{org}"))
    }

    fn user_server_key(&self, org: &str, user: &str) -> String {
        self.keys.key(&format!("user-server:{org}:{user}"))
    }

    fn migration_key(&self, sid: &str) -> String {
        self.keys.key(&format!("migrations:{sid}"))
    }

    /// Writes `connections:{sid}` with TTL and adds the session to the
    /// hosting node's and organization's index sets; if a user id is
    /// present, points `user-server:{org}:{user}` at this node. Must not
    /// leave partial state on failure — a later register on the next
    /// attempt, or the cleanup sweeper, reconciles any partial write.
    pub async fn register(&self, session: &Session) -> Result<(), ConnectionManagerError> {
        let payload = serde_json::to_string(session)?;
        self.gateway
            .set_ex(
                &self.connection_key(&session.session_id),
                &payload,
                self.config.connection_ttl.as_millis() as u64,
            )
            .await?;
        self.gateway
            .sadd(
                &self.server_connections_key(&session.node_id),
                &session.session_id,
            )
            .await?;
        self.gateway
            .sadd(&self.org_connections_key(&session.org_id), &session.session_id)
            .await?;
        if let Some(user_id) = &session.user_id {
            self.gateway
                .set_ex(
                    &self.user_server_key(&session.org_id, user_id),
                    &session.node_id,
                    self.config.connection_ttl.as_millis() as u64,
                )
                .await?;
        }

        self.registry
            .update_metrics(axonpuls_registry::NodeMetricsDelta {
                connections_delta: Some(1),
                ..Default::default()
            })
            .await;

        tracing::debug!(session_id = %session.session_id, node = %session.node_id, "session registered");
        Ok(())
    }

    /// Deletes the session key and every derived index entry. Idempotent:
    /// unregistering an already-absent session is a no-op.
    pub async fn unregister(&self, sid: &str) -> Result<(), ConnectionManagerError> {
        let session = self.get(sid).await?;
        let Some(session) = session else {
            return Ok(());
        };

        self.gateway.del(&self.connection_key(sid)).await?;
        self.gateway
            .srem(&self.server_connections_key(&session.node_id), sid)
            .await?;
        self.gateway
            .srem(&self.org_connections_key(&session.org_id), sid)
            .await?;

        if let Some(user_id) = &session.user_id {
            let user_key = self.user_server_key(&session.org_id, user_id);
            if self.gateway.get(&user_key).await? == Some(session.node_id.clone()) {
                self.gateway.del(&user_key).await?;
            }
        }

        self.registry
            .update_metrics(axonpuls_registry::NodeMetricsDelta {
                connections_delta: Some(-1),
                ..Default::default()
            })
            .await;

        tracing::debug!(session_id = %sid, "session unregistered");
        Ok(())
    }

    /// Updates `last_activity` and, if given, the subscription set;
    /// refreshes the key's TTL. A silent no-op if the session is missing.
    pub async fn touch(
        &self,
        sid: &str,
        channels: Option<HashSet<String>>,
    ) -> Result<(), ConnectionManagerError> {
        let Some(mut session) = self.get(sid).await? else {
            return Ok(());
        };

        session.last_activity = self.clock.now_unix_secs();
        if let Some(channels) = channels {
            session.channels = channels;
        }

        let payload = serde_json::to_string(&session)?;
        self.gateway
            .set_ex(
                &self.connection_key(sid),
                &payload,
                self.config.connection_ttl.as_millis() as u64,
            )
            .await?;
        Ok(())
    }

    pub async fn get(&self, sid: &str) -> Result<Option<Session>, ConnectionManagerError> {
        match self.gateway.get(&self.connection_key(sid)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Hydrates every session id in `server-connections:{node}`. An id
    /// whose record has already expired is treated as a tombstone and
    /// removed from the set rather than surfaced.
    pub async fn list_by_server(&self, node: &str) -> Result<Vec<Session>, ConnectionManagerError> {
        let ids = self.gateway.smembers(&self.server_connections_key(node)).await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {
                    let _ = self.gateway.srem(&self.server_connections_key(node), &id).await;
                }
                Err(err) => tracing::warn!(session_id = %id, error = %err, "failed to hydrate session"),
            }
        }
        Ok(sessions)
    }

    pub async fn list_by_org(&self, org: &str) -> Result<Vec<Session>, ConnectionManagerError> {
        let ids = self.gateway.smembers(&self.org_connections_key(org)).await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {
                    let _ = self.gateway.srem(&self.org_connections_key(org), &id).await;
                }
                Err(err) => tracing::warn!(session_id = %id, error = %err, "failed to hydrate session"),
            }
        }
        Ok(sessions)
    }

    /// Returns the hosting node id iff the mapping is present and the
    /// target node is still routable.
    pub async fn find_user_server(
        &self,
        org: &str,
        user: &str,
    ) -> Result<Option<String>, ConnectionManagerError> {
        let Some(node_id) = self.gateway.get(&self.user_server_key(org, user)).await? else {
            return Ok(None);
        };
        match self.registry.get_server_by_id(&node_id).await {
            Ok(Some(node)) if node.is_routable() => Ok(Some(node_id)),
            Ok(_) => Ok(None),
            Err(err) => {
                tracing::warn!(node_id = %node_id, error = %err, "failed to check target node status");
                Ok(None)
            }
        }
    }

    /// Produces `{node, connections, max, load%}` sorted ascending by
    /// load fraction.
    pub async fn get_load_metrics(&self) -> Result<Vec<LoadMetric>, ConnectionManagerError> {
        let nodes = self
            .registry
            .get_active_servers()
            .await
            .map_err(|e| ConnectionManagerError::Transient(e.to_string()))?;

        let mut metrics: Vec<LoadMetric> = nodes
            .into_iter()
            .map(|node| LoadMetric {
                node_id: node.node_id,
                connections: node.metrics.connections,
                capacity: node.capacity,
                load_fraction: if node.capacity == 0 {
                    0.0
                } else {
                    node.metrics.connections as f64 / node.capacity as f64
                },
            })
            .collect();

        metrics.sort_by(|a, b| a.load_fraction.partial_cmp(&b.load_fraction).unwrap());
        Ok(metrics)
    }

    /// Creates a migration record and signals the target node. Returns
    /// `false` if the session does not exist. A failure to notify the
    /// target is logged; per design, a failed migration is a no-op
    /// against session state and is recovered by the next cleanup tick.
    pub async fn migrate(&self, sid: &str, target: &str) -> Result<bool, ConnectionManagerError> {
        let Some(session) = self.get(sid).await? else {
            return Ok(false);
        };

        let record = MigrationRecord {
            session_id: sid.to_string(),
            source_node: session.node_id.clone(),
            target_node: target.to_string(),
            status: MigrationStatus::Pending,
            started_at: self.clock.now_unix_secs(),
            completed_at: None,
            error: None,
        };
        let payload = serde_json::to_string(&record)?;
        self.gateway
            .set_ex(
                &self.migration_key(sid),
                &payload,
                self.config.migration_ttl.as_millis() as u64,
            )
            .await?;

        if let Err(err) = self.migration_signal.notify_migration(&record, &session).await {
            tracing::warn!(session_id = %sid, target, error = %err, "migration signal failed");
        }

        Ok(true)
    }

    pub fn config(&self) -> &ConnectionManagerConfig {
        &self.config
    }
}

/// Periodically removes sessions whose `last_activity` is older than
/// `connection_ttl` (§4.E's stale-connection cleanup, S4).
pub fn spawn_cleanup_task(manager: Arc<ConnectionManager>) -> tokio::task::JoinHandle<()> {
    let interval_duration = manager.config.cleanup_interval;
    let ttl_secs = manager.config.connection_ttl.as_secs();
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(interval_duration);
            loop {
                interval.tick().await;
                if let Err(err) = run_cleanup_pass(&manager, ttl_secs).await {
                    tracing::warn!(error = %err, "cleanup pass failed, continuing next tick");
                }
            }
        }
        .instrument(tracing::info_span!("connection_cleanup")),
    )
}

async fn run_cleanup_pass(
    manager: &ConnectionManager,
    ttl_secs: u64,
) -> Result<(), ConnectionManagerError> {
    let now = manager.clock.now_unix_secs();
    let nodes = manager
        .registry
        .get_active_servers()
        .await
        .map_err(|e| ConnectionManagerError::Transient(e.to_string()))?;

    for node in nodes {
        let sessions = manager.list_by_server(&node.node_id).await?;
        for session in sessions {
            if session.status != SessionStatus::Disconnected
                && now.saturating_sub(session.last_activity) > ttl_secs
            {
                tracing::info!(session_id = %session.session_id, node = %node.node_id, "stale session removed");
                manager.unregister(&session.session_id).await?;
            }
        }
    }
    Ok(())
}

/// Periodically rebalances overloaded nodes (§4.E's load balancing, S5):
/// for each node above `load_balance_threshold`, migrates up to
/// `min(10% of its connections, target headroom)` sessions toward the
/// lowest-loaded node under half the threshold.
pub fn spawn_load_balance_task(manager: Arc<ConnectionManager>) -> tokio::task::JoinHandle<()> {
    let interval_duration = manager.config.load_balance_interval;
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(interval_duration);
            loop {
                interval.tick().await;
                if let Err(err) = run_load_balance_pass(&manager).await {
                    tracing::warn!(error = %err, "load balance pass failed, continuing next tick");
                }
            }
        }
        .instrument(tracing::info_span!("load_balance")),
    )
}

async fn run_load_balance_pass(manager: &ConnectionManager) -> Result<(), ConnectionManagerError> {
    let threshold = manager.config.load_balance_threshold;
    let metrics = manager.get_load_metrics().await?;

    let Some(target) = metrics
        .iter()
        .find(|m| m.load_fraction < threshold * 0.5)
        .cloned()
    else {
        return Ok(());
    };

    for source in metrics.iter().filter(|m| m.load_fraction > threshold) {
        let target_headroom = target.capacity.saturating_sub(target.connections);
        let quota = ((source.connections as f64 * 0.1) as u64).min(target_headroom);
        if quota == 0 {
            continue;
        }

        let candidates = manager.list_by_server(&source.node_id).await?;
        for session in candidates.into_iter().take(quota as usize) {
            manager.migrate(&session.session_id, &target.node_id).await?;
        }
        tracing::info!(
            source = %source.node_id,
            target = %target.node_id,
            quota,
            "load balance migrations initiated"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axonpuls_helpers::testing::{FakeRedisCluster, FakeRedisGateway};
    use axonpuls_helpers::time::DefaultClock;
    use axonpuls_registry::{ServerRegistry, ServerRegistryConfig};
    use std::collections::HashSet as StdHashSet;
    use tokio::sync::Mutex as TokioMutex;

    use crate::migration::MigrationSignal;
    use crate::types::MigrationRecord;

    struct RecordingMigrationSignal {
        calls: TokioMutex<Vec<(String, String)>>,
    }

    impl RecordingMigrationSignal {
        fn new() -> Arc<Self> {
            Arc::new(RecordingMigrationSignal {
                calls: TokioMutex::new(Vec::new()),
            })
        }

        async fn snapshot(&self) -> Vec<(String, String)> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl MigrationSignal for RecordingMigrationSignal {
        async fn notify_migration(&self, record: &MigrationRecord, session: &Session) -> Result<(), String> {
            self.calls.lock().await.push((session.session_id.clone(), record.target_node.clone()));
            Ok(())
        }
    }

    fn session(sid: &str, node: &str, org: &str, user: Option<&str>, last_activity: u64) -> Session {
        Session {
            session_id: sid.to_string(),
            user_id: user.map(|u| u.to_string()),
            org_id: org.to_string(),
            node_id: node.to_string(),
            socket_id: sid.to_string(),
            client_type: "web".to_string(),
            connected_at: last_activity,
            last_activity,
            channels: StdHashSet::new(),
            metadata: serde_json::json!({}),
            status: SessionStatus::Connected,
        }
    }

    async fn setup(node_id: &str, capacity: u64) -> (Arc<ConnectionManager>, Arc<ServerRegistry>) {
        let cluster = FakeRedisCluster::new();
        let gw: Arc<dyn RedisGateway> = Arc::new(FakeRedisGateway::new(cluster));
        let clock = Arc::new(DefaultClock::new());
        let registry = Arc::new(ServerRegistry::new(
            gw.clone(),
            KeyScheme::default(),
            clock.clone(),
            ServerRegistryConfig {
                node_id: node_id.to_string(),
                address: "127.0.0.1:9000".to_string(),
                version: "1.0.0".to_string(),
                region: "local".to_string(),
                capacity,
                heartbeat_period: Duration::from_secs(10),
                heartbeat_ttl: Duration::from_secs(30),
            },
        ));
        registry.register().await.unwrap();

        let manager = Arc::new(ConnectionManager::new(
            gw,
            KeyScheme::default(),
            clock,
            registry.clone(),
            Arc::new(crate::migration::NoopMigrationSignal),
            ConnectionManagerConfig::default(),
        ));
        (manager, registry)
    }

    async fn setup_shared(
        cluster: Arc<FakeRedisCluster>,
        node_id: &str,
        capacity: u64,
        migration_signal: Arc<dyn MigrationSignal>,
    ) -> (Arc<ConnectionManager>, Arc<ServerRegistry>) {
        let gw: Arc<dyn RedisGateway> = Arc::new(FakeRedisGateway::new(cluster));
        let clock = Arc::new(DefaultClock::new());
        let registry = Arc::new(ServerRegistry::new(
            gw.clone(),
            KeyScheme::default(),
            clock.clone(),
            ServerRegistryConfig {
                node_id: node_id.to_string(),
                address: format!("{node_id}.local:9000"),
                version: "1.0.0".to_string(),
                region: "local".to_string(),
                capacity,
                heartbeat_period: Duration::from_secs(10),
                heartbeat_ttl: Duration::from_secs(30),
            },
        ));
        registry.register().await.unwrap();

        let manager = Arc::new(ConnectionManager::new(
            gw,
            KeyScheme::default(),
            clock,
            registry.clone(),
            migration_signal,
            ConnectionManagerConfig::default(),
        ));
        (manager, registry)
    }

    #[tokio::test]
    async fn register_then_visible_by_server_and_org() {
        let (manager, _registry) = setup("n1", 1000).await;
        let s = session("s1", "n1", "org-a", Some("u1"), 100);
        manager.register(&s).await.unwrap();

        let by_server = manager.list_by_server("n1").await.unwrap();
        assert_eq!(by_server.len(), 1);
        let by_org = manager.list_by_org("org-a").await.unwrap();
        assert_eq!(by_org.len(), 1);
        assert_eq!(manager.find_user_server("org-a", "u1").await.unwrap(), Some("n1".to_string()));
    }

    #[tokio::test]
    async fn register_then_unregister_leaves_no_keys() {
        let (manager, _registry) = setup("n1", 1000).await;
        let s = session("s1", "n1", "org-a", Some("u1"), 100);
        manager.register(&s).await.unwrap();
        manager.unregister("s1").await.unwrap();

        assert!(manager.get("s1").await.unwrap().is_none());
        assert!(manager.list_by_server("n1").await.unwrap().is_empty());
        assert!(manager.list_by_org("org-a").await.unwrap().is_empty());
        assert_eq!(manager.find_user_server("org-a", "u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let (manager, _registry) = setup("n1", 1000).await;
        manager.unregister("missing").await.unwrap();
        manager.unregister("missing").await.unwrap();
    }

    #[tokio::test]
    async fn touch_updates_last_activity_and_channels() {
        let (manager, _registry) = setup("n1", 1000).await;
        let s = session("s1", "n1", "org-a", None, 100);
        manager.register(&s).await.unwrap();

        let mut channels = StdHashSet::new();
        channels.insert("org:org-a:general".to_string());
        manager.touch("s1", Some(channels.clone())).await.unwrap();

        let fetched = manager.get("s1").await.unwrap().unwrap();
        assert_eq!(fetched.channels, channels);
    }

    #[tokio::test]
    async fn stale_cleanup_removes_expired_session_s4() {
        let (manager, _registry) = setup("n1", 1000).await;
        let mut s = session("s1", "n1", "org-a", None, 0);
        s.last_activity = 0;
        manager.register(&s).await.unwrap();

        // last_activity=0, "now" is whatever DefaultClock gives (large unix
        // time), so the session is far older than the 300s ttl default.
        run_cleanup_pass(&manager, manager.config().connection_ttl.as_secs())
            .await
            .unwrap();

        assert!(manager.get("s1").await.unwrap().is_none());
        assert!(manager.list_by_server("n1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn migrate_returns_false_for_missing_session() {
        let (manager, _registry) = setup("n1", 1000).await;
        assert!(!manager.migrate("missing", "n2").await.unwrap());
    }

    #[tokio::test]
    async fn migrate_creates_record_for_existing_session() {
        let (manager, _registry) = setup("n1", 1000).await;
        let s = session("s1", "n1", "org-a", None, 100);
        manager.register(&s).await.unwrap();
        assert!(manager.migrate("s1", "n2").await.unwrap());
    }

    #[tokio::test]
    async fn load_balance_pass_migrates_quota_to_lowest_loaded_node_s5() {
        let cluster = FakeRedisCluster::new();
        let recorder = RecordingMigrationSignal::new();

        let (over_mgr, over_registry) = setup_shared(cluster.clone(), "node-over", 100, recorder.clone()).await;
        let (mid_mgr, mid_registry) = setup_shared(cluster.clone(), "node-mid", 100, Arc::new(crate::migration::NoopMigrationSignal)).await;
        let (low_mgr, low_registry) = setup_shared(cluster.clone(), "node-low", 100, Arc::new(crate::migration::NoopMigrationSignal)).await;

        for i in 0..92 {
            let s = session(&format!("over-{i}"), "node-over", "org-a", None, 100);
            over_mgr.register(&s).await.unwrap();
        }
        for i in 0..30 {
            let s = session(&format!("mid-{i}"), "node-mid", "org-a", None, 100);
            mid_mgr.register(&s).await.unwrap();
        }
        for i in 0..20 {
            let s = session(&format!("low-{i}"), "node-low", "org-a", None, 100);
            low_mgr.register(&s).await.unwrap();
        }
        over_registry.heartbeat().await.unwrap();
        mid_registry.heartbeat().await.unwrap();
        low_registry.heartbeat().await.unwrap();

        let metrics = over_mgr.get_load_metrics().await.unwrap();
        assert_eq!(metrics.len(), 3);
        assert_eq!(metrics[0].node_id, "node-low");
        assert!((metrics[0].load_fraction - 0.20).abs() < 1e-9);
        assert_eq!(metrics[1].node_id, "node-mid");
        assert!((metrics[1].load_fraction - 0.30).abs() < 1e-9);
        assert_eq!(metrics[2].node_id, "node-over");
        assert!((metrics[2].load_fraction - 0.92).abs() < 1e-9);

        run_load_balance_pass(&over_mgr).await.unwrap();

        // 10% of 92 connections floors to 9, well under node-low's 80-slot headroom.
        let calls = recorder.snapshot().await;
        assert_eq!(calls.len(), 9);
        assert!(calls.iter().all(|(_, target)| target == "node-low"));
    }
}
