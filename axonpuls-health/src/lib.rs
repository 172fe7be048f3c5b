pub mod probes;
pub mod service;
pub mod types;

pub use probes::{CallbackProbe, ClusterMemberCountProbe, LocalCapacityProbe, Probe, RedisPingProbe};
pub use service::{DrainController, HealthService};
pub use types::{CheckResult, HealthReport, HealthStatus, ProbeClass};
