use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, info_span, warn, Instrument};

use axonpuls_registry::ServerRegistry;

use crate::probes::Probe;
use crate::types::HealthReport;

/// Composes the registered probes into a single report (§4.G). Liveness
/// is not modeled here: it always succeeds while the process is scheduled
/// at all, so the gateway's liveness route does not consult this service.
pub struct HealthService {
    probes: Vec<Arc<dyn Probe>>,
}

impl HealthService {
    pub fn new(probes: Vec<Arc<dyn Probe>>) -> Self {
        HealthService { probes }
    }

    pub async fn check(&self) -> HealthReport {
        let mut results = Vec::with_capacity(self.probes.len());
        for probe in &self.probes {
            results.push(probe.check().await);
        }
        HealthReport::from_checks(results)
    }
}

/// Drives the drain sequence: flip to `draining`, reject new sessions
/// (callers consult `is_draining`), then unregister once existing
/// sessions close or the timeout elapses, whichever comes first.
pub struct DrainController {
    registry: Arc<ServerRegistry>,
    draining: AtomicBool,
    timeout: Duration,
}

impl DrainController {
    pub fn new(registry: Arc<ServerRegistry>, timeout: Duration) -> Self {
        DrainController {
            registry,
            draining: AtomicBool::new(false),
            timeout,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Flips local and registry state to draining. Idempotent.
    pub async fn begin_drain(&self) -> Result<(), axonpuls_registry::RegistryError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(node_id = %self.registry.node_id(), "node entering drain");
        self.registry.set_draining().await
    }

    /// Waits for `quiescent` (resolves once the caller's local session
    /// count reaches zero) or the drain timeout, then unregisters.
    pub async fn wait_and_unregister<F>(&self, quiescent: F)
    where
        F: std::future::Future<Output = ()>,
    {
        self.wait_and_unregister_with_timeout(quiescent, None).await
    }

    /// Same as `wait_and_unregister`, but lets the caller override the
    /// configured timeout for this one drain (e.g. a `{timeout?}` body
    /// on the drain request).
    pub async fn wait_and_unregister_with_timeout<F>(&self, quiescent: F, timeout_override: Option<Duration>)
    where
        F: std::future::Future<Output = ()>,
    {
        let timeout = timeout_override.unwrap_or(self.timeout);
        tokio::select! {
            _ = quiescent => {
                info!(node_id = %self.registry.node_id(), "drain quiesced before timeout");
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    node_id = %self.registry.node_id(),
                    timeout_secs = timeout.as_secs(),
                    "drain timed out with sessions still open"
                );
            }
        }

        if let Err(e) = self
            .registry
            .unregister()
            .instrument(info_span!("drain_unregister"))
            .await
        {
            warn!(error = %e, "failed to unregister node during drain");
        }
    }
}
