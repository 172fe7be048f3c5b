use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Extension;
use axum_client_ip::SecureClientIp;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, info_span, warn, Instrument};

use axonpuls_connections::{ConnectionManager, Session, SessionStatus};
use axonpuls_health::DrainController;
use axonpuls_helpers::ids::IdGenerator;
use axonpuls_helpers::time::Clock;
use axonpuls_router::{Event, LocalEventSink, Router, SendOptions};

use crate::request::RequestId;

/// A frame sent by a client over an established WebSocket connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Broadcast { channel: String, event: Event, exclude_self: Option<bool> },
    Multicast { channel: String, event: Event, node_ids: Vec<String> },
    Unicast { channel: String, event: Event, user_id: String },
}

/// A frame pushed to a client, either in response to its own traffic or
/// re-injected by the router after a cross-server delivery.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame<'a> {
    pub channel: &'a str,
    pub event: &'a Event,
    pub cross_server: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub org_id: String,
    pub user_id: Option<String>,
    #[serde(default = "default_client_type")]
    pub client_type: String,
}

fn default_client_type() -> String {
    "web".to_string()
}

struct LocalConn {
    socket: Arc<Mutex<WebSocket>>,
    channels: Arc<Mutex<HashSet<String>>>,
    org_id: String,
}

/// Tracks every WebSocket currently open on this process and delivers
/// router re-injected events to the subset subscribed to a channel.
#[derive(Clone)]
pub struct LocalSocketTable {
    conns: Arc<RwLock<HashMap<String, LocalConn>>>,
    local_count: Arc<AtomicU64>,
}

impl LocalSocketTable {
    pub fn new() -> Self {
        LocalSocketTable {
            conns: Arc::new(RwLock::new(HashMap::new())),
            local_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn local_count_handle(&self) -> Arc<AtomicU64> {
        self.local_count.clone()
    }

    pub fn len(&self) -> usize {
        self.local_count.load(Ordering::Relaxed) as usize
    }

    async fn insert(&self, session_id: String, socket: Arc<Mutex<WebSocket>>, org_id: String) -> Arc<Mutex<HashSet<String>>> {
        let channels = Arc::new(Mutex::new(HashSet::new()));
        self.conns.write().await.insert(
            session_id,
            LocalConn {
                socket,
                channels: channels.clone(),
                org_id,
            },
        );
        self.local_count.fetch_add(1, Ordering::Relaxed);
        channels
    }

    async fn remove(&self, session_id: &str) {
        if self.conns.write().await.remove(session_id).is_some() {
            self.local_count.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Default for LocalSocketTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalEventSink for LocalSocketTable {
    async fn deliver(&self, channel: &str, event: &Event, cross_server: bool, source_node: Option<&str>) -> Result<(), String> {
        let conns = self.conns.read().await;
        let frame = ServerFrame { channel, event, cross_server };
        let payload = serde_json::to_string(&frame).map_err(|e| format!("failed to serialize re-injected event: {e}"))?;

        let mut failures = 0usize;
        for (session_id, conn) in conns.iter() {
            if !conn.channels.lock().await.contains(channel) {
                continue;
            }
            let mut socket = conn.socket.lock().await;
            if let Err(e) = socket.send(Message::Text(payload.clone())).await {
                warn!(
                    session_id,
                    source_node = source_node.unwrap_or("-"),
                    error = %e,
                    "failed to deliver re-injected event to local socket"
                );
                failures += 1;
            }
        }

        if failures > 0 {
            return Err(format!("failed to deliver to {failures} local socket(s)"));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub connections: Arc<ConnectionManager>,
    pub router: Arc<Router>,
    pub sockets: LocalSocketTable,
    pub node_id: String,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub drain: Arc<DrainController>,
}

pub(crate) async fn handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    _secure_ip: SecureClientIp,
    Extension(request_id): Extension<RequestId>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    if state.drain.is_draining() {
        return (StatusCode::SERVICE_UNAVAILABLE, "node is draining, rejecting new sessions").into_response();
    }
    ws.on_upgrade(move |socket| {
        handle_socket(socket, query, request_id.0, state).instrument(info_span!("websocket_connection"))
    })
    .into_response()
}

async fn handle_socket(socket: WebSocket, query: ConnectQuery, connection_id: String, state: GatewayState) {
    let session_id = state.ids.generate();
    let now = state.clock.now_unix_secs();
    let session = Session {
        session_id: session_id.clone(),
        user_id: query.user_id.clone(),
        org_id: query.org_id.clone(),
        node_id: state.node_id.clone(),
        socket_id: connection_id,
        client_type: query.client_type.clone(),
        connected_at: now,
        last_activity: now,
        channels: HashSet::new(),
        metadata: serde_json::Value::Null,
        status: SessionStatus::Connected,
    };

    if let Err(e) = state.connections.register(&session).await {
        error!(session_id = %session_id, error = %e, "failed to register session, closing connection");
        return;
    }

    let socket_ref = Arc::new(Mutex::new(socket));
    let channels = state.sockets.insert(session_id.clone(), socket_ref.clone(), query.org_id.clone()).await;
    info!(session_id = %session_id, org_id = %query.org_id, "session connected");

    let mut connection_alive = true;
    while connection_alive {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut socket = socket_ref.lock().await;
        match socket.recv().await {
            Some(Ok(msg)) => {
                drop(socket);
                if process_message(msg, &session_id, &channels, &state).await.is_break() {
                    connection_alive = false;
                }
            }
            _ => {
                connection_alive = false;
            }
        }
    }

    state.sockets.remove(&session_id).await;
    if let Err(e) = state.connections.unregister(&session_id).await {
        warn!(session_id = %session_id, error = %e, "failed to unregister session on disconnect");
    }
    info!(session_id = %session_id, "session disconnected");
}

async fn process_message(
    msg: Message,
    session_id: &str,
    channels: &Arc<Mutex<HashSet<String>>>,
    state: &GatewayState,
) -> ControlFlow<(), ()> {
    let text = match msg {
        Message::Text(text) => text,
        Message::Close(_) => return ControlFlow::Break(()),
        _ => return ControlFlow::Continue(()),
    };

    let frame: ClientFrame = match serde_json::from_str(&text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(session_id, error = %e, "dropping malformed client frame");
            return ControlFlow::Continue(());
        }
    };

    match frame {
        ClientFrame::Subscribe { channel } => {
            channels.lock().await.insert(channel);
        }
        ClientFrame::Unsubscribe { channel } => {
            channels.lock().await.remove(&channel);
        }
        ClientFrame::Broadcast { channel, event, exclude_self } => {
            let org_id = match state.connections.get(session_id).await {
                Ok(Some(session)) => session.org_id,
                _ => return ControlFlow::Continue(()),
            };
            let options = SendOptions {
                exclude_self: exclude_self.unwrap_or(false),
                ack: false,
            };
            if let Err(e) = state.router.broadcast(&org_id, &channel, event, options).await {
                warn!(session_id, error = %e, "broadcast failed");
            }
        }
        ClientFrame::Multicast { channel, event, node_ids } => {
            let org_id = match state.connections.get(session_id).await {
                Ok(Some(session)) => session.org_id,
                _ => return ControlFlow::Continue(()),
            };
            if let Err(e) = state
                .router
                .multicast(node_ids, &org_id, &channel, event, SendOptions::default())
                .await
            {
                warn!(session_id, error = %e, "multicast failed");
            }
        }
        ClientFrame::Unicast { channel, event, user_id } => {
            let org_id = match state.connections.get(session_id).await {
                Ok(Some(session)) => session.org_id,
                _ => return ControlFlow::Continue(()),
            };
            if let Err(e) = state
                .router
                .unicast_to_user(&user_id, &org_id, &channel, event, SendOptions::default())
                .await
            {
                warn!(session_id, error = %e, "unicast failed");
            }
        }
    }

    let snapshot = channels.lock().await.clone();
    if let Err(e) = state.connections.touch(session_id, Some(snapshot)).await {
        warn!(session_id, error = %e, "failed to touch session");
    }

    ControlFlow::Continue(())
}
