use serde::{Deserialize, Serialize};

/// The classification a single probe reports, independent of the overall
/// rollup. Named after the spec's own vocabulary ("latency class",
/// "capacity class", "member count class").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeClass {
    Ok,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub class: ProbeClass,
    pub detail: Option<String>,
    pub latency_ms: Option<u64>,
}

impl CheckResult {
    pub fn ok(name: impl Into<String>) -> Self {
        CheckResult {
            name: name.into(),
            class: ProbeClass::Ok,
            detail: None,
            latency_ms: None,
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        CheckResult {
            name: name.into(),
            class: ProbeClass::Warn,
            detail: Some(detail.into()),
            latency_ms: None,
        }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        CheckResult {
            name: name.into(),
            class: ProbeClass::Fail,
            detail: Some(detail.into()),
            latency_ms: None,
        }
    }
}

/// Overall status rollup: any `fail` -> unhealthy; any `warn` -> degraded;
/// else healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<CheckResult>,
}

impl HealthReport {
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        let status = if checks.iter().any(|c| c.class == ProbeClass::Fail) {
            HealthStatus::Unhealthy
        } else if checks.iter().any(|c| c.class == ProbeClass::Warn) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthReport { status, checks }
    }

    /// Readiness is the conjunction of sub-checks: a single failing probe
    /// takes the node out of rotation, but a warning (degraded capacity,
    /// single-node cluster) does not.
    pub fn is_ready(&self) -> bool {
        !self.checks.iter().any(|c| c.class == ProbeClass::Fail)
    }
}
