use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Draining,
    Unhealthy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub connections: u64,
    pub avg_latency_ms: f64,
    pub messages_per_second: f64,
}

impl NodeMetrics {
    /// Merges a delta into the current snapshot. Connection counts are
    /// additive (callers pass +1/-1 on register/unregister); latency and
    /// throughput are replaced wholesale since they are already averages
    /// computed by the caller.
    pub fn merge(&mut self, delta: &NodeMetricsDelta) {
        if let Some(conn_delta) = delta.connections_delta {
            self.connections = (self.connections as i64 + conn_delta).max(0) as u64;
        }
        if let Some(avg_latency_ms) = delta.avg_latency_ms {
            self.avg_latency_ms = avg_latency_ms;
        }
        if let Some(mps) = delta.messages_per_second {
            self.messages_per_second = mps;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeMetricsDelta {
    pub connections_delta: Option<i64>,
    pub avg_latency_ms: Option<f64>,
    pub messages_per_second: Option<f64>,
}

/// Fleet-membership descriptor for one node. Serialized verbatim into
/// `servers:{node_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub address: String,
    pub version: String,
    pub region: String,
    pub capacity: u64,
    pub status: NodeStatus,
    pub metrics: NodeMetrics,
    pub heartbeat_at: u64,
}

impl Node {
    pub fn is_routable(&self) -> bool {
        matches!(self.status, NodeStatus::Active | NodeStatus::Draining)
    }
}
