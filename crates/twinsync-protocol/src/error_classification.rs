use crate::error::TwinError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoverableError {
    NetworkError,
    ServiceUnavailable,
    Throttled,
}

impl RecoverableError {
    #[must_use]
    pub fn base_delay_multiplier(&self) -> u32 {
        match self {
            Self::Throttled => 10,
            Self::ServiceUnavailable => 2,
            Self::NetworkError => 1,
        }
    }
}

impl TwinError {
    /// Returns the recovery class for errors worth another attempt.
    ///
    /// `Timeout` is not classified; the caller decides whether to reissue
    /// a timed-out request.
    #[must_use]
    pub fn classify(&self) -> Option<RecoverableError> {
        match self {
            Self::ConnectionError(msg) => classify_connection_error(msg),
            Self::ConnectionLost(_) => Some(RecoverableError::NetworkError),
            Self::Service { status, .. } => classify_status(*status),
            _ => None,
        }
    }
}

fn classify_connection_error(msg: &str) -> Option<RecoverableError> {
    let msg = msg.to_ascii_lowercase();

    if msg.contains("unauthorized")
        || msg.contains("not authorized")
        || msg.contains("authentication")
        || msg.contains("bad credentials")
    {
        return None;
    }

    Some(RecoverableError::NetworkError)
}

fn classify_status(status: u16) -> Option<RecoverableError> {
    match status {
        429 => Some(RecoverableError::Throttled),
        500 | 502 | 503 => Some(RecoverableError::ServiceUnavailable),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_classification() {
        let error = TwinError::ConnectionError("connection reset".to_string());
        assert_eq!(error.classify(), Some(RecoverableError::NetworkError));

        let error = TwinError::ConnectionError("handshake timed out".to_string());
        assert_eq!(error.classify(), Some(RecoverableError::NetworkError));

        let error = TwinError::ConnectionError("Unauthorized: token expired".to_string());
        assert_eq!(error.classify(), None);
    }

    #[test]
    fn test_status_classification() {
        let throttled = TwinError::Service {
            status: 429,
            message: String::new(),
        };
        assert_eq!(throttled.classify(), Some(RecoverableError::Throttled));

        let busy = TwinError::Service {
            status: 503,
            message: String::new(),
        };
        assert_eq!(busy.classify(), Some(RecoverableError::ServiceUnavailable));

        let precondition = TwinError::Service {
            status: 412,
            message: String::new(),
        };
        assert_eq!(precondition.classify(), None);
    }

    #[test]
    fn test_non_recoverable_kinds() {
        assert_eq!(TwinError::Timeout.classify(), None);
        assert_eq!(TwinError::SessionClosed.classify(), None);
        assert_eq!(
            TwinError::AlreadyExists("device-1".to_string()).classify(),
            None
        );
        assert_eq!(
            TwinError::InvalidArgument("empty".to_string()).classify(),
            None
        );
    }

    #[test]
    fn test_delay_multipliers() {
        assert_eq!(RecoverableError::NetworkError.base_delay_multiplier(), 1);
        assert_eq!(RecoverableError::Throttled.base_delay_multiplier(), 10);
    }
}
