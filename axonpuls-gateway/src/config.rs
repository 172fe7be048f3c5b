use std::time::Duration;

use axonpuls_helpers::env::EnvVars;
use axonpuls_helpers::gateway::KeyScheme;
use axonpuls_helpers::redis::ConnectionConfig;
use axonpuls_registry::ServerRegistryConfig;

const DEFAULT_HTTP_PORT: &str = "8080";
const DEFAULT_CAPACITY: &str = "10000";
const DEFAULT_HEARTBEAT_PERIOD_SECS: &str = "5";
const DEFAULT_HEARTBEAT_TTL_SECS: &str = "30";
const DEFAULT_CONNECTION_TTL_SECS: &str = "300";
const DEFAULT_CLEANUP_INTERVAL_SECS: &str = "60";
const DEFAULT_LOAD_BALANCE_INTERVAL_SECS: &str = "300";
const DEFAULT_LOAD_BALANCE_THRESHOLD: &str = "0.8";
const DEFAULT_MIGRATION_TTL_SECS: &str = "300";
const DEFAULT_MESSAGE_TTL_SECS: &str = "60";
const DEFAULT_DRAIN_TIMEOUT_SECS: &str = "30";
const DEFAULT_KEY_PREFIX: &str = "axonpuls:";

/// Sources node and cluster configuration from the process environment
/// (`AXONPULS_*`), the way the runtime sources its own `CELERITY_*`
/// configuration: required values panic with a descriptive message,
/// optional ones fall back to documented defaults.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub address: String,
    pub version: String,
    pub region: String,
    pub capacity: u64,
    pub http_port: u16,
    pub redis: ConnectionConfig,
    pub key_prefix: String,
    pub heartbeat_period: Duration,
    pub heartbeat_ttl: Duration,
    pub connection_ttl: Duration,
    pub cleanup_interval: Duration,
    pub load_balance_interval: Duration,
    pub load_balance_threshold: f64,
    pub migration_ttl: Duration,
    pub message_ttl: Duration,
    pub drain_timeout: Duration,
}

impl NodeConfig {
    pub fn from_env(env: &impl EnvVars) -> Self {
        let node_id = env
            .var("AXONPULS_NODE_ID")
            .unwrap_or_else(|_| nanoid::nanoid!());

        let address = env
            .var("AXONPULS_ADVERTISE_ADDRESS")
            .expect("AXONPULS_ADVERTISE_ADDRESS must be set to this node's reachable address");

        let version = env
            .var("AXONPULS_VERSION")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

        let region = env.var("AXONPULS_REGION").unwrap_or_else(|_| "local".to_string());

        let capacity = parse_required_or_default(env, "AXONPULS_CAPACITY", DEFAULT_CAPACITY);

        let http_port = parse_required_or_default(env, "AXONPULS_HTTP_PORT", DEFAULT_HTTP_PORT);

        let redis_nodes = env
            .var("AXONPULS_REDIS_NODES")
            .expect("AXONPULS_REDIS_NODES must be set, comma-separated")
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();
        let redis_password = env.var("AXONPULS_REDIS_PASSWORD").ok();
        let redis_cluster_mode = env
            .var("AXONPULS_REDIS_CLUSTER_MODE")
            .map(|v| v.parse().expect("AXONPULS_REDIS_CLUSTER_MODE must be true or false"))
            .unwrap_or(false);

        let key_prefix = env
            .var("AXONPULS_KEY_PREFIX")
            .unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string());

        NodeConfig {
            node_id,
            address,
            version,
            region,
            capacity,
            http_port,
            redis: ConnectionConfig {
                nodes: redis_nodes,
                password: redis_password,
                cluster_mode: redis_cluster_mode,
            },
            key_prefix,
            heartbeat_period: Duration::from_secs(parse_required_or_default(
                env,
                "AXONPULS_HEARTBEAT_PERIOD_SECS",
                DEFAULT_HEARTBEAT_PERIOD_SECS,
            )),
            heartbeat_ttl: Duration::from_secs(parse_required_or_default(
                env,
                "AXONPULS_HEARTBEAT_TTL_SECS",
                DEFAULT_HEARTBEAT_TTL_SECS,
            )),
            connection_ttl: Duration::from_secs(parse_required_or_default(
                env,
                "AXONPULS_CONNECTION_TTL_SECS",
                DEFAULT_CONNECTION_TTL_SECS,
            )),
            cleanup_interval: Duration::from_secs(parse_required_or_default(
                env,
                "AXONPULS_CLEANUP_INTERVAL_SECS",
                DEFAULT_CLEANUP_INTERVAL_SECS,
            )),
            load_balance_interval: Duration::from_secs(parse_required_or_default(
                env,
                "AXONPULS_LOAD_BALANCE_INTERVAL_SECS",
                DEFAULT_LOAD_BALANCE_INTERVAL_SECS,
            )),
            load_balance_threshold: parse_required_or_default(
                env,
                "AXONPULS_LOAD_BALANCE_THRESHOLD",
                DEFAULT_LOAD_BALANCE_THRESHOLD,
            ),
            migration_ttl: Duration::from_secs(parse_required_or_default(
                env,
                "AXONPULS_MIGRATION_TTL_SECS",
                DEFAULT_MIGRATION_TTL_SECS,
            )),
            message_ttl: Duration::from_secs(parse_required_or_default(
                env,
                "AXONPULS_MESSAGE_TTL_SECS",
                DEFAULT_MESSAGE_TTL_SECS,
            )),
            drain_timeout: Duration::from_secs(parse_required_or_default(
                env,
                "AXONPULS_DRAIN_TIMEOUT_SECS",
                DEFAULT_DRAIN_TIMEOUT_SECS,
            )),
        }
    }

    pub fn key_scheme(&self) -> KeyScheme {
        KeyScheme::new(self.key_prefix.clone())
    }

    pub fn registry_config(&self) -> ServerRegistryConfig {
        ServerRegistryConfig {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            version: self.version.clone(),
            region: self.region.clone(),
            capacity: self.capacity,
            heartbeat_period: self.heartbeat_period,
            heartbeat_ttl: self.heartbeat_ttl,
        }
    }
}

fn parse_required_or_default<T: std::str::FromStr>(env: &impl EnvVars, key: &str, default: &str) -> T
where
    T::Err: std::fmt::Debug,
{
    env.var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or_else(|e| panic!("invalid value for {key}: {e:?}"))
}

#[cfg(test)]
mod tests {
    use axonpuls_helpers::env::MapEnvVars;

    use super::*;

    #[test]
    fn from_env_applies_defaults_for_optional_fields() {
        let env = MapEnvVars::new()
            .with("AXONPULS_ADVERTISE_ADDRESS", "10.0.0.5:9000")
            .with("AXONPULS_REDIS_NODES", "redis://localhost:6379");

        let config = NodeConfig::from_env(&env);
        assert_eq!(config.address, "10.0.0.5:9000");
        assert_eq!(config.capacity, 10_000);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.redis.nodes, vec!["redis://localhost:6379".to_string()]);
        assert!(!config.redis.cluster_mode);
    }

    #[test]
    fn from_env_splits_multiple_redis_nodes() {
        let env = MapEnvVars::new()
            .with("AXONPULS_ADVERTISE_ADDRESS", "10.0.0.5:9000")
            .with("AXONPULS_REDIS_NODES", "redis://a:6379, redis://b:6379")
            .with("AXONPULS_REDIS_CLUSTER_MODE", "true");

        let config = NodeConfig::from_env(&env);
        assert_eq!(
            config.redis.nodes,
            vec!["redis://a:6379".to_string(), "redis://b:6379".to_string()]
        );
        assert!(config.redis.cluster_mode);
    }

    #[test]
    #[should_panic(expected = "AXONPULS_ADVERTISE_ADDRESS")]
    fn from_env_panics_without_advertise_address() {
        let env = MapEnvVars::new().with("AXONPULS_REDIS_NODES", "redis://localhost:6379");
        NodeConfig::from_env(&env);
    }
}
