use serde::{Deserialize, Serialize};

/// The router never interprets payloads; a small sum type stands in for
/// the arbitrary event records the source language would pass around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Broadcast,
    Multicast,
    Unicast,
}

/// Optional delivery controls accepted by `broadcast`/`multicast`/`unicast_to_user`.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub exclude_self: bool,
    pub ack: bool,
}

/// The envelope carrying an event between nodes over pub/sub (§3). Written
/// to `cross-server:messages:{id}` and published on the global channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossServerMessage {
    pub message_id: String,
    pub kind: MessageKind,
    pub source_node: String,
    pub target_node_ids: Vec<String>,
    pub org_id: String,
    pub user_id: Option<String>,
    pub channel: String,
    pub event: Event,
    pub created_at: u64,
    pub ttl_secs: u64,
    pub ack_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Delivered,
    Failed,
}

/// Published on `cross-server:ack:{source_node}` when the sender asked
/// for an acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub message_id: String,
    pub node_id: String,
    pub status: AckStatus,
    pub ts: u64,
    pub error: Option<String>,
}

/// One row of `delivery_status(message_id)`'s output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub node_id: String,
    pub status: AckStatus,
    pub ts: u64,
    pub error: Option<String>,
}
