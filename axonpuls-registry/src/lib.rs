pub mod errors;
pub mod registry;
pub mod types;

pub use errors::RegistryError;
pub use registry::{spawn_heartbeat_task, ServerRegistry, ServerRegistryConfig};
pub use types::{Node, NodeMetrics, NodeMetricsDelta, NodeStatus};
