//! Peer media transport

mod transport;

pub use transport::{PeerChannels, PeerTransport};

use bytes::Bytes;
use std::fmt;

/// Aggregate peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl PeerState {
    /// `Failed` and `Closed` end the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Closed)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::New => "new",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Failed => "failed",
            PeerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// One received RTP packet, re-serialized
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub kind: MediaKind,
    pub payload: Bytes,
}

/// Control-plane event from the peer transport
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalIceCandidate(crate::signaling::IceCandidate),
    ConnectionState(PeerState),
}
