use std::fmt;

#[derive(Debug)]
pub enum ConnectionManagerError {
    /// Transient I/O talking to Redis; retryable by the caller.
    Transient(String),
    /// A session record failed to deserialize; logged and dropped, the
    /// containing index entry is treated as a tombstone.
    Protocol(String),
    /// The session id is already registered to a different node; the
    /// caller must not proceed and the cleanup sweeper is the recovery
    /// path, per §7.
    Invariant(String),
}

impl fmt::Display for ConnectionManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionManagerError::Transient(msg) => write!(f, "transient error: {msg}"),
            ConnectionManagerError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            ConnectionManagerError::Invariant(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for ConnectionManagerError {}

impl From<redis::RedisError> for ConnectionManagerError {
    fn from(err: redis::RedisError) -> Self {
        ConnectionManagerError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for ConnectionManagerError {
    fn from(err: serde_json::Error) -> Self {
        ConnectionManagerError::Protocol(err.to_string())
    }
}
