use async_trait::async_trait;

use crate::types::{MigrationRecord, Session};

/// Signals a migration request to the target node. Implemented by the
/// event router, which turns the request into a `connection_migration_request`
/// message on the shared cross-server bus (§9: "the migration request is a
/// message on the shared bus; no component holds a direct back-reference").
/// Kept as a trait here so this crate never depends on the router crate.
#[async_trait]
pub trait MigrationSignal: Send + Sync {
    async fn notify_migration(
        &self,
        record: &MigrationRecord,
        session: &Session,
    ) -> Result<(), String>;
}

/// A signal that does nothing, for callers that only need local manager
/// semantics (e.g. unit tests of register/unregister/touch).
pub struct NoopMigrationSignal;

#[async_trait]
impl MigrationSignal for NoopMigrationSignal {
    async fn notify_migration(
        &self,
        _record: &MigrationRecord,
        _session: &Session,
    ) -> Result<(), String> {
        Ok(())
    }
}
