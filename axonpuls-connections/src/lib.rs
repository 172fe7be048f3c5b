pub mod errors;
pub mod manager;
pub mod migration;
pub mod types;

pub use errors::ConnectionManagerError;
pub use manager::{
    spawn_cleanup_task, spawn_load_balance_task, ConnectionManager, ConnectionManagerConfig,
};
pub use migration::{MigrationSignal, NoopMigrationSignal};
pub use types::{LoadMetric, MigrationRecord, MigrationStatus, Session, SessionStatus};
