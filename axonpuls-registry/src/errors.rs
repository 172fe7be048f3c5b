use std::fmt;

#[derive(Debug)]
pub enum RegistryError {
    /// Transient I/O talking to Redis; retryable by the caller via the
    /// resilience engine.
    Transient(String),
    /// The node record could not be deserialized; logged and dropped.
    Protocol(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Transient(msg) => write!(f, "registry transient error: {msg}"),
            RegistryError::Protocol(msg) => write!(f, "registry protocol error: {msg}"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<redis::RedisError> for RegistryError {
    fn from(err: redis::RedisError) -> Self {
        RegistryError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Protocol(err.to_string())
    }
}
