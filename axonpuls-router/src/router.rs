use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info_span, warn, Instrument};

use axonpuls_helpers::gateway::{KeyScheme, RedisGateway};
use axonpuls_helpers::ids::IdGenerator;
use axonpuls_helpers::time::Clock;
use axonpuls_registry::ServerRegistry;

use crate::cache::DedupeCache;
use crate::errors::RouterError;
use crate::transport::{InboundFrame, Transport};
use crate::types::{Ack, AckStatus, CrossServerMessage, DeliveryRecord, Event, MessageKind, SendOptions};

/// The local collaborator events are handed to after cross-server
/// re-injection; owned by the gateway glue, not this crate. A logging
/// no-op stands in where nothing else is wired up (e.g. in tests). An
/// `Err` surfaces as a `failed` ack when the sender asked for one.
#[async_trait]
pub trait LocalEventSink: Send + Sync {
    async fn deliver(&self, channel: &str, event: &Event, cross_server: bool, source_node: Option<&str>) -> Result<(), String>;
}

pub struct NoopLocalEventSink;

#[async_trait]
impl LocalEventSink for NoopLocalEventSink {
    async fn deliver(&self, channel: &str, event: &Event, cross_server: bool, source_node: Option<&str>) -> Result<(), String> {
        warn!(
            channel,
            event_id = %event.id,
            cross_server,
            source_node = source_node.unwrap_or("-"),
            "no local event sink wired up; dropping re-injected event"
        );
        Ok(())
    }
}

pub struct RouterConfig {
    pub message_ttl: Duration,
    pub ack_deadline: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            message_ttl: Duration::from_secs(60),
            ack_deadline: Duration::from_secs(5),
        }
    }
}

/// Addressed delivery between nodes over shared pub/sub, with duplicate
/// suppression, acknowledgment tracking, and local re-injection.
pub struct Router {
    node_id: String,
    gateway: Arc<dyn RedisGateway>,
    keys: KeyScheme,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    registry: Arc<ServerRegistry>,
    connections: Arc<axonpuls_connections::ConnectionManager>,
    transport: Arc<dyn Transport>,
    cache: Arc<DedupeCache>,
    sink: Arc<dyn LocalEventSink>,
    config: RouterConfig,
    deliveries: Mutex<HashMap<String, Vec<DeliveryRecord>>>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: String,
        gateway: Arc<dyn RedisGateway>,
        keys: KeyScheme,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        registry: Arc<ServerRegistry>,
        connections: Arc<axonpuls_connections::ConnectionManager>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn LocalEventSink>,
        config: RouterConfig,
    ) -> Self {
        let cache = Arc::new(DedupeCache::new(config.message_ttl, clock.clone()));
        Router {
            node_id,
            gateway,
            keys,
            clock,
            ids,
            registry,
            connections,
            transport,
            cache,
            sink,
            config,
            deliveries: Mutex::new(HashMap::new()),
        }
    }

    fn message_key(&self, message_id: &str) -> String {
        self.keys.key(&format!("cross-server:messages:{message_id}"))
    }

    async fn send(
        &self,
        kind: MessageKind,
        target_node_ids: Vec<String>,
        org_id: &str,
        user_id: Option<String>,
        channel: &str,
        event: Event,
        options: &SendOptions,
    ) -> Result<String, RouterError> {
        let message_id = self.ids.generate();
        let message = CrossServerMessage {
            message_id: message_id.clone(),
            kind,
            source_node: self.node_id.clone(),
            target_node_ids,
            org_id: org_id.to_string(),
            user_id,
            channel: channel.to_string(),
            event,
            created_at: self.clock.now_unix_secs(),
            ttl_secs: self.config.message_ttl.as_secs(),
            ack_requested: options.ack,
        };

        let json = serde_json::to_string(&message)?;
        self.gateway
            .set_ex(&self.message_key(&message_id), &json, self.config.message_ttl.as_millis() as u64)
            .await?;

        if options.ack {
            self.deliveries.lock().await.insert(message_id.clone(), Vec::new());
        }

        self.transport.publish_event(&message).await?;
        Ok(message_id)
    }

    /// Addresses every active node (minus self if requested). Returns
    /// `None` when there are no eligible targets.
    pub async fn broadcast(
        &self,
        org_id: &str,
        channel: &str,
        event: Event,
        options: SendOptions,
    ) -> Result<Option<String>, RouterError> {
        let active = self
            .registry
            .get_active_servers()
            .await
            .map_err(|e| RouterError::Transient(e.to_string()))?;

        let targets: Vec<String> = active
            .into_iter()
            .map(|n| n.node_id)
            .filter(|id| !(options.exclude_self && *id == self.node_id))
            .collect();

        if targets.is_empty() {
            return Ok(None);
        }

        // Broadcast addresses everyone; an empty target list in the wire
        // message means "no restriction", not "no targets".
        let id = self
            .send(MessageKind::Broadcast, Vec::new(), org_id, None, channel, event, &options)
            .await?;
        Ok(Some(id))
    }

    pub async fn multicast(
        &self,
        node_ids: Vec<String>,
        org_id: &str,
        channel: &str,
        event: Event,
        options: SendOptions,
    ) -> Result<String, RouterError> {
        self.send(MessageKind::Multicast, node_ids, org_id, None, channel, event, &options)
            .await
    }

    /// Resolves the hosting node via the connection manager; returns
    /// `None` if the user is not connected anywhere.
    pub async fn unicast_to_user(
        &self,
        user_id: &str,
        org_id: &str,
        channel: &str,
        event: Event,
        options: SendOptions,
    ) -> Result<Option<String>, RouterError> {
        let target = self
            .connections
            .find_user_server(org_id, user_id)
            .await
            .map_err(|e| RouterError::Transient(e.to_string()))?;

        let Some(target_node) = target else {
            return Ok(None);
        };

        let id = self
            .send(
                MessageKind::Unicast,
                vec![target_node],
                org_id,
                Some(user_id.to_string()),
                channel,
                event,
                &options,
            )
            .await?;
        Ok(Some(id))
    }

    pub async fn delivery_status(&self, message_id: &str) -> Vec<DeliveryRecord> {
        self.deliveries
            .lock()
            .await
            .get(message_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Processes one frame off the transport's inbound stream, implementing
    /// the receive-side protocol: self-origin drop, target filtering,
    /// dedupe, re-injection, and optional ack publish.
    async fn handle_event(&self, source_node: String, message: CrossServerMessage) {
        if source_node == self.node_id {
            return;
        }
        if !message.target_node_ids.is_empty() && !message.target_node_ids.contains(&self.node_id) {
            return;
        }
        if self.cache.check_and_insert(&message.message_id).await {
            return;
        }

        let delivery = self
            .sink
            .deliver(&message.channel, &message.event, true, Some(&source_node))
            .await;

        if let Err(e) = &delivery {
            warn!(error = %e, message_id = %message.message_id, "local delivery failed");
        }

        if message.ack_requested {
            let ack = match delivery {
                Ok(()) => Ack {
                    message_id: message.message_id.clone(),
                    node_id: self.node_id.clone(),
                    status: AckStatus::Delivered,
                    ts: self.clock.now_unix_secs(),
                    error: None,
                },
                Err(e) => Ack {
                    message_id: message.message_id.clone(),
                    node_id: self.node_id.clone(),
                    status: AckStatus::Failed,
                    ts: self.clock.now_unix_secs(),
                    error: Some(e),
                },
            };
            if let Err(e) = self.transport.publish_ack(&source_node, &ack).await {
                warn!(error = %e, message_id = %message.message_id, "failed to publish ack");
            }
        }
    }

    async fn handle_ack(&self, ack: Ack) {
        let mut deliveries = self.deliveries.lock().await;
        if let Some(records) = deliveries.get_mut(&ack.message_id) {
            records.push(DeliveryRecord {
                node_id: ack.node_id,
                status: ack.status,
                ts: ack.ts,
                error: ack.error,
            });
        }
    }

    async fn handle_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Event { source_node, message } => self.handle_event(source_node, message).await,
            InboundFrame::Ack { source_node: _, ack } => self.handle_ack(ack).await,
        }
    }
}

/// Drains the transport's inbound stream into the router for the life of
/// the process; errors in individual frames are logged, never fatal.
pub fn spawn_inbound_task(
    router: Arc<Router>,
    mut inbound: tokio::sync::mpsc::UnboundedReceiver<InboundFrame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            while let Some(frame) = inbound.recv().await {
                router.handle_frame(frame).await;
            }
        }
        .instrument(info_span!("router_inbound")),
    )
}

pub fn spawn_cache_gc_task(router: Arc<Router>, period: Duration) -> tokio::task::JoinHandle<()> {
    let cache = router.cache.clone();
    crate::cache::spawn_gc_task(cache, period)
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use axonpuls_connections::{ConnectionManager, ConnectionManagerConfig, NoopMigrationSignal};
    use axonpuls_helpers::ids::NanoIdGenerator;
    use axonpuls_helpers::testing::{FakeRedisCluster, FakeRedisGateway};
    use axonpuls_helpers::time::DefaultClock;
    use axonpuls_registry::{ServerRegistry, ServerRegistryConfig};
    use tokio::sync::Mutex as TokioMutex;
    use tokio::time::timeout;

    use super::*;
    use crate::transport::in_memory_transport::{connect as in_memory_connect, InMemoryBus};

    struct RecordingSink {
        events: TokioMutex<Vec<(String, String, bool, Option<String>)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSink {
                events: TokioMutex::new(Vec::new()),
            })
        }

        async fn snapshot(&self) -> Vec<(String, String, bool, Option<String>)> {
            self.events.lock().await.clone()
        }
    }

    #[async_trait]
    impl LocalEventSink for RecordingSink {
        async fn deliver(&self, channel: &str, event: &Event, cross_server: bool, source_node: Option<&str>) -> Result<(), String> {
            self.events.lock().await.push((
                channel.to_string(),
                event.id.clone(),
                cross_server,
                source_node.map(|s| s.to_string()),
            ));
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl LocalEventSink for FailingSink {
        async fn deliver(&self, _channel: &str, _event: &Event, _cross_server: bool, _source_node: Option<&str>) -> Result<(), String> {
            Err("socket closed".to_string())
        }
    }

    fn test_event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            event_type: "message.created".to_string(),
            payload: serde_json::json!({ "text": "hi" }),
            metadata: serde_json::json!({}),
        }
    }

    async fn build_node(
        bus: Arc<InMemoryBus>,
        node_id: &str,
        cluster: Arc<FakeRedisCluster>,
    ) -> (Arc<Router>, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let router = build_node_with_sink(bus, node_id, cluster, sink.clone()).await.0;
        (router, sink)
    }

    async fn build_node_with_sink(
        bus: Arc<InMemoryBus>,
        node_id: &str,
        cluster: Arc<FakeRedisCluster>,
        sink: Arc<dyn LocalEventSink>,
    ) -> (Arc<Router>, Arc<dyn LocalEventSink>) {
        let gateway: Arc<dyn RedisGateway> = Arc::new(FakeRedisGateway::new(cluster));
        let clock: Arc<dyn Clock> = Arc::new(DefaultClock::new());
        let keys = KeyScheme::default();

        let registry = Arc::new(ServerRegistry::new(
            gateway.clone(),
            keys.clone(),
            clock.clone(),
            ServerRegistryConfig {
                node_id: node_id.to_string(),
                address: format!("{node_id}.local:9000"),
                version: "test".to_string(),
                region: "local".to_string(),
                capacity: 1000,
                heartbeat_period: StdDuration::from_secs(5),
                heartbeat_ttl: StdDuration::from_secs(30),
            },
        ));
        registry.register().await.expect("register node");

        let connections = Arc::new(ConnectionManager::new(
            gateway.clone(),
            keys.clone(),
            clock.clone(),
            registry.clone(),
            Arc::new(NoopMigrationSignal),
            ConnectionManagerConfig::default(),
        ));

        let (transport, inbound) = in_memory_connect(bus, node_id.to_string()).await;

        let router = Arc::new(Router::new(
            node_id.to_string(),
            gateway,
            keys,
            clock,
            Arc::new(NanoIdGenerator::new()),
            registry,
            connections,
            transport,
            sink.clone(),
            RouterConfig::default(),
        ));

        spawn_inbound_task(router.clone(), inbound);
        (router, sink)
    }

    #[tokio::test]
    async fn broadcast_is_reinjected_on_peer_node_s1() {
        let bus = InMemoryBus::new();
        let cluster = FakeRedisCluster::new();
        let (router_a, _sink_a) = build_node(bus.clone(), "node-a", cluster.clone()).await;
        let (_router_b, sink_b) = build_node(bus.clone(), "node-b", cluster.clone()).await;

        let message_id = router_a
            .broadcast("org-1", "chat:general", test_event("evt-1"), SendOptions::default())
            .await
            .expect("broadcast should succeed")
            .expect("should have at least one target");
        assert!(!message_id.is_empty());

        let events = timeout(StdDuration::from_millis(500), async {
            loop {
                let snapshot = sink_b.snapshot().await;
                if !snapshot.is_empty() {
                    return snapshot;
                }
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .expect("peer should receive broadcast");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "chat:general");
        assert_eq!(events[0].1, "evt-1");
        assert!(events[0].2);
        assert_eq!(events[0].3.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn broadcast_with_no_peers_returns_none() {
        let bus = InMemoryBus::new();
        let cluster = FakeRedisCluster::new();
        let (router_a, _sink_a) = build_node(bus, "solo-node", cluster).await;

        let result = router_a
            .broadcast("org-1", "chat:general", test_event("evt-1"), SendOptions { exclude_self: true, ack: false })
            .await
            .expect("broadcast should succeed");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn redelivered_message_is_suppressed_s2() {
        let bus = InMemoryBus::new();
        let cluster = FakeRedisCluster::new();
        let (_router_a, _sink_a) = build_node(bus.clone(), "node-a", cluster.clone()).await;
        let (_router_b, sink_b) = build_node(bus.clone(), "node-b", cluster.clone()).await;

        let (transport_a_dup, _unused_inbound) = in_memory_connect(bus.clone(), "node-a".to_string()).await;
        let message = CrossServerMessage {
            message_id: "dup-msg".to_string(),
            kind: MessageKind::Broadcast,
            source_node: "node-a".to_string(),
            target_node_ids: Vec::new(),
            org_id: "org-1".to_string(),
            user_id: None,
            channel: "chat:general".to_string(),
            event: test_event("evt-dup"),
            created_at: 0,
            ttl_secs: 60,
            ack_requested: false,
        };

        transport_a_dup.publish_event(&message).await.expect("publish 1");
        transport_a_dup.publish_event(&message).await.expect("publish 2");

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        let events = sink_b.snapshot().await;
        assert_eq!(events.len(), 1, "duplicate delivery must be suppressed");
    }

    #[tokio::test]
    async fn failed_local_delivery_publishes_failed_ack_s_ack() {
        let bus = InMemoryBus::new();
        let cluster = FakeRedisCluster::new();

        let gateway_a: Arc<dyn RedisGateway> = Arc::new(FakeRedisGateway::new(cluster.clone()));
        let clock: Arc<dyn Clock> = Arc::new(DefaultClock::new());
        let keys = KeyScheme::default();
        let registry_a = Arc::new(ServerRegistry::new(
            gateway_a.clone(),
            keys.clone(),
            clock.clone(),
            ServerRegistryConfig {
                node_id: "node-a".to_string(),
                address: "node-a.local:9000".to_string(),
                version: "test".to_string(),
                region: "local".to_string(),
                capacity: 1000,
                heartbeat_period: StdDuration::from_secs(5),
                heartbeat_ttl: StdDuration::from_secs(30),
            },
        ));
        registry_a.register().await.expect("register node-a");
        let connections_a = Arc::new(ConnectionManager::new(
            gateway_a.clone(),
            keys.clone(),
            clock.clone(),
            registry_a.clone(),
            Arc::new(NoopMigrationSignal),
            ConnectionManagerConfig::default(),
        ));
        let (transport_a, inbound_a) = in_memory_connect(bus.clone(), "node-a".to_string()).await;
        let router_a = Arc::new(Router::new(
            "node-a".to_string(),
            gateway_a,
            keys.clone(),
            clock.clone(),
            Arc::new(NanoIdGenerator::new()),
            registry_a,
            connections_a,
            transport_a,
            RecordingSink::new(),
            RouterConfig::default(),
        ));
        spawn_inbound_task(router_a.clone(), inbound_a);

        let (_router_b, _sink_b) = build_node_with_sink(bus, "node-b", cluster, Arc::new(FailingSink)).await;

        let message_id = router_a
            .broadcast(
                "org-1",
                "chat:general",
                test_event("evt-ack"),
                SendOptions { exclude_self: false, ack: true },
            )
            .await
            .expect("broadcast should succeed")
            .expect("should have at least one target");

        let records = timeout(StdDuration::from_millis(500), async {
            loop {
                let records = router_a.delivery_status(&message_id).await;
                if !records.is_empty() {
                    return records;
                }
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .expect("should receive an ack from node-b");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AckStatus::Failed);
        assert_eq!(records[0].error.as_deref(), Some("socket closed"));
    }

    #[tokio::test]
    async fn unicast_to_unconnected_user_returns_none() {
        let bus = InMemoryBus::new();
        let cluster = FakeRedisCluster::new();
        let (router_a, _sink_a) = build_node(bus, "node-a", cluster).await;

        let result = router_a
            .unicast_to_user("user-404", "org-1", "dm:user-404", test_event("evt-1"), SendOptions::default())
            .await
            .expect("unicast should succeed");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn unicast_reaches_only_the_hosting_node_s3() {
        let bus = InMemoryBus::new();
        let cluster = FakeRedisCluster::new();
        let (router_a, sink_a) = build_node(bus.clone(), "node-a", cluster.clone()).await;
        let (router_b, sink_b) = build_node(bus.clone(), "node-b", cluster.clone()).await;

        let gateway: Arc<dyn RedisGateway> = Arc::new(FakeRedisGateway::new(cluster));
        let keys = KeyScheme::default();
        let user_key = keys.key("user-server:org-1:user-42");
        gateway
            .set_ex(&user_key, "node-b", 300_000)
            .await
            .expect("seed user-server mapping");

        let message_id = router_a
            .unicast_to_user("user-42", "org-1", "dm:user-42", test_event("evt-dm"), SendOptions::default())
            .await
            .expect("unicast should succeed")
            .expect("user is connected on node-b");
        assert!(!message_id.is_empty());

        let events = timeout(StdDuration::from_millis(500), async {
            loop {
                let snapshot = sink_b.snapshot().await;
                if !snapshot.is_empty() {
                    return snapshot;
                }
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .expect("hosting node should receive unicast");
        assert_eq!(events[0].1, "evt-dm");

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(sink_a.snapshot().await.is_empty(), "sender must not re-deliver to itself");

        // router_b retained for lifetime of its background tasks.
        let _ = router_b;
    }
}
