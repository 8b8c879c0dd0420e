use thiserror::Error;

pub type Result<T> = std::result::Result<T, TwinError>;

/// Every failure a public twin or method operation can report.
///
/// Stale desired-property deltas are not represented here: they are logged
/// and dropped by the cache without reaching the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TwinError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Timeout")]
    Timeout,

    #[error("Device not connected: {0}")]
    DeviceNotConnected(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Service returned status {status}: {message}")]
    Service { status: u16, message: String },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TwinError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Transport-level failures that may succeed when the operation is
    /// attempted again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.classify().is_some()
    }

    /// Maps a non-success service status to the error kind callers see.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => Self::InvalidArgument(message),
            404 => Self::NotFound(message),
            409 => Self::AlreadyExists(message),
            504 => Self::Timeout,
            _ => Self::Service { status, message },
        }
    }
}

impl From<serde_json::Error> for TwinError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            TwinError::from_status(400, "bad"),
            TwinError::InvalidArgument("bad".to_string())
        );
        assert_eq!(TwinError::from_status(504, "late"), TwinError::Timeout);
        assert_eq!(
            TwinError::from_status(409, "dup"),
            TwinError::AlreadyExists("dup".to_string())
        );
        assert_eq!(
            TwinError::from_status(500, "boom"),
            TwinError::Service {
                status: 500,
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn test_display() {
        let err = TwinError::Service {
            status: 429,
            message: "throttled".to_string(),
        };
        assert_eq!(err.to_string(), "Service returned status 429: throttled");
        assert_eq!(TwinError::SessionClosed.to_string(), "Session closed");
    }
}
