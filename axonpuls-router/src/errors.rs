use std::fmt;

#[derive(Debug)]
pub enum RouterError {
    /// Publish failures and other transient I/O; retryable by the caller.
    Transient(String),
    /// An unparseable cross-server message; logged and dropped, never
    /// propagated to peers.
    Protocol(String),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::Transient(msg) => write!(f, "router transient error: {msg}"),
            RouterError::Protocol(msg) => write!(f, "router protocol error: {msg}"),
        }
    }
}

impl std::error::Error for RouterError {}

impl From<redis::RedisError> for RouterError {
    fn from(err: redis::RedisError) -> Self {
        RouterError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(err: serde_json::Error) -> Self {
        RouterError::Protocol(err.to_string())
    }
}
