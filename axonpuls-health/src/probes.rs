use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use axonpuls_helpers::gateway::RedisGateway;
use axonpuls_registry::ServerRegistry;

use crate::types::CheckResult;

#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> CheckResult;
}

/// Redis ping, classified by round-trip latency.
pub struct RedisPingProbe {
    gateway: Arc<dyn RedisGateway>,
    warn_threshold_ms: u64,
    fail_threshold_ms: u64,
}

impl RedisPingProbe {
    pub fn new(gateway: Arc<dyn RedisGateway>) -> Self {
        RedisPingProbe {
            gateway,
            warn_threshold_ms: 50,
            fail_threshold_ms: 200,
        }
    }
}

#[async_trait]
impl Probe for RedisPingProbe {
    async fn check(&self) -> CheckResult {
        let start = Instant::now();
        match self.gateway.ping().await {
            Ok(()) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                if latency_ms >= self.fail_threshold_ms {
                    CheckResult::fail("redis", format!("ping latency {latency_ms}ms exceeds threshold"))
                        .with_latency(latency_ms)
                } else if latency_ms >= self.warn_threshold_ms {
                    CheckResult::warn("redis", format!("ping latency {latency_ms}ms elevated"))
                        .with_latency(latency_ms)
                } else {
                    CheckResult::ok("redis").with_latency(latency_ms)
                }
            }
            Err(e) => CheckResult::fail("redis", e.to_string()),
        }
    }
}

/// Local WebSocket capacity, classified by fraction of `capacity` in use.
pub struct LocalCapacityProbe {
    current: Arc<AtomicU64>,
    capacity: u64,
    warn_fraction: f64,
    fail_fraction: f64,
}

impl LocalCapacityProbe {
    pub fn new(current: Arc<AtomicU64>, capacity: u64) -> Self {
        LocalCapacityProbe {
            current,
            capacity,
            warn_fraction: 0.8,
            fail_fraction: 0.95,
        }
    }
}

#[async_trait]
impl Probe for LocalCapacityProbe {
    async fn check(&self) -> CheckResult {
        if self.capacity == 0 {
            return CheckResult::fail("local_capacity", "capacity is zero");
        }
        let connections = self.current.load(Ordering::Relaxed);
        let fraction = connections as f64 / self.capacity as f64;
        let detail = format!("{connections}/{} connections ({:.0}%)", self.capacity, fraction * 100.0);
        if fraction >= self.fail_fraction {
            CheckResult::fail("local_capacity", detail)
        } else if fraction >= self.warn_fraction {
            CheckResult::warn("local_capacity", detail)
        } else {
            CheckResult::ok("local_capacity").with_detail(detail)
        }
    }
}

/// Cluster member count, classified to flag a node running with no peers.
pub struct ClusterMemberCountProbe {
    registry: Arc<ServerRegistry>,
}

impl ClusterMemberCountProbe {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        ClusterMemberCountProbe { registry }
    }
}

#[async_trait]
impl Probe for ClusterMemberCountProbe {
    async fn check(&self) -> CheckResult {
        match self.registry.get_active_servers().await {
            Ok(servers) if servers.is_empty() => {
                CheckResult::fail("cluster_members", "no active servers visible, including self")
            }
            Ok(servers) if servers.len() == 1 => {
                CheckResult::warn("cluster_members", "running with no peer nodes")
            }
            Ok(servers) => CheckResult::ok("cluster_members").with_detail(format!("{} active", servers.len())),
            Err(e) => CheckResult::fail("cluster_members", e.to_string()),
        }
    }
}

type BoxedCheckFuture = Pin<Box<dyn Future<Output = CheckResult> + Send>>;

/// Wraps an arbitrary async closure as a probe; used for the router
/// reachability check, which otherwise would pull a dependency on the
/// router crate into this one for a single boolean.
pub struct CallbackProbe {
    name: String,
    check_fn: Arc<dyn Fn() -> BoxedCheckFuture + Send + Sync>,
}

impl CallbackProbe {
    pub fn new<F, Fut>(name: impl Into<String>, check_fn: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CheckResult> + Send + 'static,
    {
        CallbackProbe {
            name: name.into(),
            check_fn: Arc::new(move || Box::pin(check_fn())),
        }
    }
}

#[async_trait]
impl Probe for CallbackProbe {
    async fn check(&self) -> CheckResult {
        let _ = &self.name;
        (self.check_fn)().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;

    #[tokio::test]
    async fn local_capacity_probe_classifies_by_fraction() {
        let current = Arc::new(AtomicU64::new(50));
        let probe = LocalCapacityProbe::new(current.clone(), 100);
        assert_eq!(probe.check().await.class, crate::types::ProbeClass::Ok);

        current.store(85, Ordering::Relaxed);
        assert_eq!(probe.check().await.class, crate::types::ProbeClass::Warn);

        current.store(96, Ordering::Relaxed);
        assert_eq!(probe.check().await.class, crate::types::ProbeClass::Fail);
    }

    #[tokio::test]
    async fn callback_probe_delegates_to_closure() {
        let probe = CallbackProbe::new("router", || async { CheckResult::ok("router") });
        let result = probe.check().await;
        assert_eq!(result.class, crate::types::ProbeClass::Ok);
    }
}
