pub mod cache;
pub mod errors;
pub mod router;
pub mod transport;
pub mod types;

pub use cache::DedupeCache;
pub use errors::RouterError;
pub use router::{spawn_cache_gc_task, spawn_inbound_task, LocalEventSink, NoopLocalEventSink, Router, RouterConfig};
pub use transport::{InboundFrame, Transport};
pub use types::{Ack, AckStatus, CrossServerMessage, DeliveryRecord, Event, MessageKind, SendOptions};
