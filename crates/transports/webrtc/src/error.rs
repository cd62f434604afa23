//! Error types for the WebRTC streaming transport

use camstream_core::ErrorClass;

/// Result type alias using WebRTC Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while signaling, negotiating or relaying media
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Credential could not be used to reach the provider
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Signaling protocol error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Signaling link already ended
    #[error("Signaling link closed: {0}")]
    LinkClosed(String),

    /// Provider stopped answering heartbeats
    #[error("Heartbeat timeout: {0}")]
    HeartbeatTimeout(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Invalid data format
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Error raised by the session core (ports, transcoder, requests)
    #[error(transparent)]
    Core(#[from] camstream_core::Error),

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
            Error::InvalidConfig(_) | Error::InvalidCredential(_) => ErrorClass::Configuration,
            Error::SignalingError(_)
            | Error::WebSocketError(_)
            | Error::LinkClosed(_)
            | Error::PeerConnectionError(_)
            | Error::WebRtcError(_)
            | Error::IoError(_) => ErrorClass::Transport,
            Error::HeartbeatTimeout(_) => ErrorClass::Heartbeat,
            Error::OperationTimeout(_)
            | Error::SdpError(_)
            | Error::IceCandidateError(_)
            | Error::InvalidData(_)
            | Error::SerializationError(_) => ErrorClass::Negotiation,
            Error::Core(e) => e.class(),
            Error::Other(_) => ErrorClass::Internal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::SignalingError(_)
            | Error::WebSocketError(_)
            | Error::HeartbeatTimeout(_)
            | Error::OperationTimeout(_)
            | Error::IoError(_) => true,
            Error::Core(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerConnectionError(_) | Error::IceCandidateError(_) | Error::SdpError(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocketError(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtcError(e.to_string())
    }
}
