//! Error types for the streaming session core

/// Result type alias using the core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of failures.
///
/// Every error raised inside a session is eventually folded into one of these
/// classes before it is turned into a lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Offer/answer exchange failed or timed out
    Negotiation,
    /// Peer connection or signaling transport failure
    Transport,
    /// Transcoder spawn failure or abnormal exit
    Pipeline,
    /// Application heartbeat starvation
    Heartbeat,
    /// Worker pool could not accept the request
    Scheduling,
    /// Bad configuration or malformed request
    Configuration,
    /// Should not occur in normal operation
    Internal,
}

/// Errors that can occur in the session core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed start/stop request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A non-terminal session already exists for the device
    #[error("Session already active for device {0}")]
    SessionAlreadyActive(String),

    /// No local ports could be reserved within the allotted time
    #[error("Port reservation failed: {0}")]
    PortsExhausted(String),

    /// Transcoder process could not be started or exited abnormally
    #[error("Transcoder error: {0}")]
    TranscoderError(String),

    /// Worker slot is gone or refused the command
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidConfig(_) | Error::InvalidRequest(_) | Error::SerializationError(_) => {
                ErrorClass::Configuration
            }
            Error::SessionAlreadyActive(_) | Error::WorkerUnavailable(_) => ErrorClass::Scheduling,
            Error::PortsExhausted(_) | Error::TranscoderError(_) | Error::IoError(_) => {
                ErrorClass::Pipeline
            }
            Error::OperationTimeout(_) => ErrorClass::Negotiation,
            Error::InternalError(_) | Error::Other(_) => ErrorClass::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PortsExhausted(_) | Error::OperationTimeout(_) | Error::WorkerUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::SessionAlreadyActive("cam-1".to_string());
        assert_eq!(err.to_string(), "Session already active for device cam-1");
    }

    #[test]
    fn test_error_class() {
        assert_eq!(
            Error::PortsExhausted("none left".into()).class(),
            ErrorClass::Pipeline
        );
        assert_eq!(
            Error::SessionAlreadyActive("cam".into()).class(),
            ErrorClass::Scheduling
        );
        assert_eq!(
            Error::InvalidRequest("missing".into()).class(),
            ErrorClass::Configuration
        );
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::PortsExhausted("test".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(Error::from(json_err), Error::SerializationError(_)));
    }
}
