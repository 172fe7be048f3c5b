use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connected,
    Disconnected,
    Migrating,
}

/// One active WebSocket connection, cluster-wide. Serialized verbatim
/// into `connections:{session_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: Option<String>,
    pub org_id: String,
    pub node_id: String,
    pub socket_id: String,
    pub client_type: String,
    pub connected_at: u64,
    pub last_activity: u64,
    pub channels: HashSet<String>,
    pub metadata: serde_json::Value,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub session_id: String,
    pub source_node: String,
    pub target_node: String,
    pub status: MigrationStatus,
    pub started_at: u64,
    pub completed_at: Option<u64>,
    pub error: Option<String>,
}

/// One row of `get_load_metrics()`'s output: a node's current share of
/// its own capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadMetric {
    pub node_id: String,
    pub connections: u64,
    pub capacity: u64,
    pub load_fraction: f64,
}
