use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use axonpuls_connections::{spawn_cleanup_task, spawn_load_balance_task, ConnectionManager, ConnectionManagerConfig, NoopMigrationSignal};
use axonpuls_health::{CallbackProbe, CheckResult, ClusterMemberCountProbe, DrainController, HealthService, LocalCapacityProbe, RedisPingProbe};
use axonpuls_helpers::gateway::{RealRedisGateway, RedisGateway};
use axonpuls_helpers::http_types::{HealthCheckResponse, ResponseMessage};
use axonpuls_helpers::ids::NanoIdGenerator;
use axonpuls_helpers::time::{Clock, DefaultClock};
use axonpuls_registry::{spawn_heartbeat_task, ServerRegistry};
use axonpuls_resilience::{CircuitBreakerConfig, ResilienceEngine, RetryStrategy};
use axonpuls_router::transport::redis_transport;
use axonpuls_router::{spawn_cache_gc_task, spawn_inbound_task, Router as EventRouter, RouterConfig};

use crate::config::NodeConfig;
use crate::errors::GatewayHttpError;
use crate::request::request_id;
use crate::telemetry::{enrich_span, log_request};
use crate::websocket::{self, GatewayState, LocalSocketTable};

/// Wires every subsystem together and drives the process lifecycle: connect,
/// register, spawn background tasks, serve HTTP + WebSocket, then drain and
/// unregister on shutdown signal.
pub struct Application {
    config: NodeConfig,
}

impl Application {
    pub fn new(config: NodeConfig) -> Self {
        Application { config }
    }

    pub async fn run(&self) -> Result<(), GatewayHttpError> {
        let clock: Arc<dyn Clock> = Arc::new(DefaultClock::new());
        let ids = Arc::new(NanoIdGenerator::new());
        let keys = self.config.key_scheme();
        let resilience = Arc::new(ResilienceEngine::new(CircuitBreakerConfig::default()).with_clock(clock.clone()));

        let gateway: Arc<dyn RedisGateway> = Arc::new(
            resilience
                .execute_with_retry(
                    "redis-connect",
                    &RetryStrategy::default_exponential(),
                    5,
                    |_: &redis::RedisError| true,
                    || RealRedisGateway::connect(&self.config.redis),
                )
                .await
                .map_err(|e| GatewayHttpError::Internal(format!("failed to connect to redis: {e}")))?,
        );

        let registry = Arc::new(ServerRegistry::new(gateway.clone(), keys.clone(), clock.clone(), self.config.registry_config()));
        registry
            .register()
            .await
            .map_err(|e| GatewayHttpError::Internal(format!("failed to register node: {e}")))?;
        spawn_heartbeat_task(registry.clone());
        info!(node_id = %registry.node_id(), "node registered");

        let connections = Arc::new(ConnectionManager::new(
            gateway.clone(),
            keys.clone(),
            clock.clone(),
            registry.clone(),
            Arc::new(NoopMigrationSignal),
            ConnectionManagerConfig {
                connection_ttl: self.config.connection_ttl,
                cleanup_interval: self.config.cleanup_interval,
                load_balance_interval: self.config.load_balance_interval,
                load_balance_threshold: self.config.load_balance_threshold,
                migration_ttl: self.config.migration_ttl,
            },
        ));
        spawn_cleanup_task(connections.clone());
        spawn_load_balance_task(connections.clone());

        let sockets = LocalSocketTable::new();
        let local_count = sockets.local_count_handle();

        let (transport, inbound) = redis_transport::connect(self.config.redis.clone(), keys.clone(), self.config.node_id.clone())
            .await
            .map_err(|e| GatewayHttpError::Internal(format!("failed to connect router transport: {e}")))?;

        let router = Arc::new(EventRouter::new(
            self.config.node_id.clone(),
            gateway.clone(),
            keys.clone(),
            clock.clone(),
            ids.clone(),
            registry.clone(),
            connections.clone(),
            transport,
            Arc::new(sockets.clone()),
            RouterConfig {
                message_ttl: self.config.message_ttl,
                ack_deadline: Duration::from_secs(5),
            },
        ));
        spawn_inbound_task(router.clone(), inbound);
        spawn_cache_gc_task(router.clone(), Duration::from_secs(60));

        let health = Arc::new(HealthService::new(vec![
            Arc::new(RedisPingProbe::new(gateway.clone())),
            Arc::new(LocalCapacityProbe::new(local_count.clone(), self.config.capacity)),
            Arc::new(ClusterMemberCountProbe::new(registry.clone())),
            Arc::new(CallbackProbe::new("resilience_breakers", || async { CheckResult::ok("resilience_breakers") })),
        ]));
        let drain = Arc::new(DrainController::new(registry.clone(), self.config.drain_timeout));

        let gateway_state = GatewayState {
            connections: connections.clone(),
            router: router.clone(),
            sockets: sockets.clone(),
            node_id: self.config.node_id.clone(),
            ids: ids.clone(),
            clock: clock.clone(),
            drain: drain.clone(),
        };

        let app = build_router(gateway_state, health.clone(), drain.clone(), sockets.clone());

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.config.http_port))
            .await
            .map_err(|e| GatewayHttpError::Internal(format!("failed to bind http port: {e}")))?;
        info!(port = self.config.http_port, "listening");

        let server = axum::serve(listener, app);
        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    warn!(error = %e, "http server exited with error");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, draining");
            }
        }

        drain
            .begin_drain()
            .await
            .map_err(|e| GatewayHttpError::Internal(format!("failed to begin drain: {e}")))?;
        let quiescent = async {
            loop {
                if sockets.len() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        };
        drain.wait_and_unregister(quiescent).await;

        Ok(())
    }
}

#[derive(Clone)]
struct HealthState {
    health: Arc<HealthService>,
    drain: Arc<DrainController>,
    sockets: LocalSocketTable,
}

/// Body of `POST /health/drain`; `timeout_secs` overrides the configured
/// drain timeout for this one drain if present.
#[derive(serde::Deserialize, Default)]
struct DrainRequest {
    timeout_secs: Option<u64>,
}

fn build_router(gateway_state: GatewayState, health: Arc<HealthService>, drain: Arc<DrainController>, sockets: LocalSocketTable) -> AxumRouter {
    let health_state = HealthState { health, drain, sockets };

    let ws_routes = AxumRouter::new()
        .route("/ws", get(websocket::handler))
        .with_state(gateway_state)
        .layer(axum::middleware::from_fn(enrich_span))
        .layer(axum::middleware::from_fn(request_id));

    let health_routes = AxumRouter::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/health/websocket", get(health_websocket))
        .route("/health/drain", post(health_drain))
        .with_state(health_state);

    AxumRouter::new()
        .merge(ws_routes)
        .merge(health_routes)
        .layer(axum::middleware::from_fn(log_request))
        .layer(CorsLayer::permissive())
}

async fn health_live() -> impl IntoResponse {
    Json(HealthCheckResponse {
        timestamp: DefaultClock::new().now_unix_secs(),
    })
}

async fn health_ready(State(state): State<HealthState>) -> Result<impl IntoResponse, GatewayHttpError> {
    if state.drain.is_draining() {
        return Err(GatewayHttpError::NotReady("node is draining".to_string()));
    }
    let report = state.health.check().await;
    if report.is_ready() {
        Ok(Json(report))
    } else {
        Err(GatewayHttpError::NotReady("one or more checks failed".to_string()))
    }
}

async fn health_websocket(State(state): State<HealthState>) -> impl IntoResponse {
    Json(state.health.check().await)
}

/// Begins drain and, in the background, waits for local sessions to close
/// (or the timeout, optionally overridden by the request body) before
/// unregistering the node. Returns as soon as the flag is flipped.
async fn health_drain(State(state): State<HealthState>, body: Option<Json<DrainRequest>>) -> Result<impl IntoResponse, GatewayHttpError> {
    state
        .drain
        .begin_drain()
        .await
        .map_err(|e| GatewayHttpError::Internal(format!("failed to begin drain: {e}")))?;

    let timeout_override = body.and_then(|Json(req)| req.timeout_secs).map(Duration::from_secs);
    let drain = state.drain.clone();
    let sockets = state.sockets.clone();
    tokio::spawn(async move {
        let quiescent = async {
            loop {
                if sockets.len() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        };
        drain.wait_and_unregister_with_timeout(quiescent, timeout_override).await;
    });

    Ok((StatusCode::ACCEPTED, Json(ResponseMessage::new("draining"))))
}
