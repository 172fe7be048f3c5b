use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::RouterError;
use crate::types::{Ack, CrossServerMessage};

/// A frame received from the bus, with the node that published it. Loop
/// prevention (dropping self-originated frames) happens in the router,
/// not the transport, so transports stay dumb relays.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Event {
        source_node: String,
        message: CrossServerMessage,
    },
    Ack {
        source_node: String,
        ack: Ack,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope<T> {
    pub source_node: String,
    pub body: T,
}

/// Publishes onto the two channels named in §6.1: the global events
/// channel and a given node's ack channel. One transport instance per
/// node; inbound frames arrive on the receiver returned alongside it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish_event(&self, message: &CrossServerMessage) -> Result<(), RouterError>;
    async fn publish_ack(&self, target_node: &str, ack: &Ack) -> Result<(), RouterError>;
}

pub mod redis_transport {
    use std::sync::Arc;

    use redis::{FromRedisValue, PushKind};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::sync::Mutex;
    use tracing::{debug, warn};

    use axonpuls_helpers::gateway::KeyScheme;
    use axonpuls_helpers::redis::{get_redis_connection, ConnectionConfig, ConnectionWrapper};

    use super::*;

    /// Redis-backed transport: subscribes once to the shared events
    /// channel and once to this node's own ack channel over the same
    /// connection, distinguishing pushed frames by the channel name RESP3
    /// reports alongside the payload.
    pub struct RedisTransport {
        conn: Mutex<ConnectionWrapper>,
        events_channel: String,
        keys: KeyScheme,
    }

    #[async_trait]
    impl Transport for RedisTransport {
        async fn publish_event(&self, message: &CrossServerMessage) -> Result<(), RouterError> {
            let envelope = Envelope {
                source_node: message.source_node.clone(),
                body: message.clone(),
            };
            let json = serde_json::to_string(&envelope)?;
            self.conn.lock().await.publish(&self.events_channel, json).await?;
            Ok(())
        }

        async fn publish_ack(&self, target_node: &str, ack: &Ack) -> Result<(), RouterError> {
            let envelope = Envelope {
                source_node: ack.node_id.clone(),
                body: ack.clone(),
            };
            let json = serde_json::to_string(&envelope)?;
            let channel = self.keys.key(&format!("cross-server:ack:{target_node}"));
            self.conn.lock().await.publish(&channel, json).await?;
            Ok(())
        }
    }

    /// Connects to Redis and spawns the subscriber loop described in
    /// §4.F's protocol step 2: self-originated event frames are dropped;
    /// ack frames are only forwarded if addressed to this node.
    pub async fn connect(
        conn_config: ConnectionConfig,
        keys: KeyScheme,
        node_id: String,
    ) -> Result<(Arc<dyn Transport>, UnboundedReceiver<InboundFrame>), RouterError> {
        let events_channel = keys.key("cross-server:events");
        let ack_channel = keys.key(&format!("cross-server:ack:{node_id}"));

        let (redis_tx, mut redis_rx) = unbounded_channel();
        let mut sub_conn = get_redis_connection(&conn_config, Some(redis_tx)).await?;
        sub_conn.subscribe(&events_channel).await?;
        sub_conn.subscribe(&ack_channel).await?;

        let pub_conn = get_redis_connection(&conn_config, None).await?;

        let (out_tx, mut out_rx) = unbounded_channel::<InboundFrame>();
        let events_channel_task = events_channel.clone();
        let node_id_task = node_id.clone();

        tokio::spawn(async move {
            loop {
                match redis_rx.recv().await {
                    Some(push) if push.kind == PushKind::Message && push.data.len() >= 2 => {
                        let channel = match String::from_redis_value(&push.data[0]) {
                            Ok(c) => c,
                            Err(e) => {
                                warn!(error = %e, "failed to read push channel name");
                                continue;
                            }
                        };
                        let body = match String::from_redis_value(&push.data[1]) {
                            Ok(b) => b,
                            Err(e) => {
                                warn!(error = %e, "failed to read push payload");
                                continue;
                            }
                        };

                        if channel == events_channel_task {
                            match serde_json::from_str::<Envelope<CrossServerMessage>>(&body) {
                                Ok(envelope) => {
                                    let frame = InboundFrame::Event {
                                        source_node: envelope.source_node,
                                        message: envelope.body,
                                    };
                                    if out_tx.send(frame).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, "dropping unparseable cross-server message"),
                            }
                        } else {
                            match serde_json::from_str::<Envelope<Ack>>(&body) {
                                Ok(envelope) => {
                                    let frame = InboundFrame::Ack {
                                        source_node: envelope.source_node,
                                        ack: envelope.body,
                                    };
                                    if out_tx.send(frame).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, "dropping unparseable ack"),
                            }
                        }
                    }
                    Some(_) => {
                        debug!(node = %node_id_task, "ignoring non-message push frame");
                    }
                    None => break,
                }
            }
        });

        let transport = RedisTransport {
            conn: Mutex::new(pub_conn),
            events_channel,
            keys,
        };
        Ok((Arc::new(transport), out_rx))
    }
}

pub mod in_memory_transport {
    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::sync::broadcast;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::sync::Mutex;

    use super::*;

    const CHANNEL_CAPACITY: usize = 1024;

    enum BusFrame {
        Event {
            source_node: String,
            message: CrossServerMessage,
        },
        Ack {
            source_node: String,
            ack: Ack,
        },
    }

    impl Clone for BusFrame {
        fn clone(&self) -> Self {
            match self {
                BusFrame::Event { source_node, message } => BusFrame::Event {
                    source_node: source_node.clone(),
                    message: message.clone(),
                },
                BusFrame::Ack { source_node, ack } => BusFrame::Ack {
                    source_node: source_node.clone(),
                    ack: ack.clone(),
                },
            }
        }
    }

    /// A shared in-memory bus standing in for a Redis deployment in
    /// tests, so multi-node router scenarios run without a live server.
    pub struct InMemoryBus {
        events: broadcast::Sender<BusFrame>,
        ack_channels: Mutex<HashMap<String, broadcast::Sender<BusFrame>>>,
    }

    impl InMemoryBus {
        pub fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
            Arc::new(InMemoryBus {
                events,
                ack_channels: Mutex::new(HashMap::new()),
            })
        }

        async fn ack_sender(&self, node_id: &str) -> broadcast::Sender<BusFrame> {
            let mut channels = self.ack_channels.lock().await;
            channels
                .entry(node_id.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone()
        }
    }

    pub struct InMemoryTransport {
        bus: Arc<InMemoryBus>,
        node_id: String,
    }

    #[async_trait]
    impl Transport for InMemoryTransport {
        async fn publish_event(&self, message: &CrossServerMessage) -> Result<(), RouterError> {
            let _ = self.bus.events.send(BusFrame::Event {
                source_node: self.node_id.clone(),
                message: message.clone(),
            });
            Ok(())
        }

        async fn publish_ack(&self, target_node: &str, ack: &Ack) -> Result<(), RouterError> {
            let sender = self.bus.ack_sender(target_node).await;
            let _ = sender.send(BusFrame::Ack {
                source_node: self.node_id.clone(),
                ack: ack.clone(),
            });
            Ok(())
        }
    }

    /// Registers `node_id` on the bus, returning a transport and the
    /// merged inbound stream of events-channel and own-ack-channel
    /// frames, mirroring the Redis transport's shape.
    pub async fn connect(
        bus: Arc<InMemoryBus>,
        node_id: String,
    ) -> (Arc<dyn Transport>, UnboundedReceiver<InboundFrame>) {
        let mut events_rx = bus.events.subscribe();
        let mut ack_rx = bus.ack_sender(&node_id).await.subscribe();
        let (out_tx, out_rx) = unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok(frame) = events_rx.recv() => {
                        if let BusFrame::Event { source_node, message } = frame {
                            if out_tx.send(InboundFrame::Event { source_node, message }).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(frame) = ack_rx.recv() => {
                        if let BusFrame::Ack { source_node, ack } = frame {
                            if out_tx.send(InboundFrame::Ack { source_node, ack }).is_err() {
                                break;
                            }
                        }
                    }
                    else => break,
                }
            }
        });

        (Arc::new(InMemoryTransport { bus, node_id }), out_rx)
    }
}
