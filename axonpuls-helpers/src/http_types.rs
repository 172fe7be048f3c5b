use serde::{Deserialize, Serialize};

/// Generic JSON error/status body returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub message: String,
}

impl ResponseMessage {
    pub fn new(message: impl Into<String>) -> Self {
        ResponseMessage { message: message.into() }
    }
}

/// Body returned by the liveness probe, which never fails while the
/// process is scheduled at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub timestamp: u64,
}
