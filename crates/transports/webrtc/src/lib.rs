//! camstream WebRTC transport
//!
//! Live camera views negotiated over the provider's signaling service and
//! received with a WebRTC peer connection, plus the recording relay used for
//! event clips. [`StreamLauncher`] plugs both into the worker pool of
//! `camstream-core`.
//!
//! # Architecture
//!
//! - [`signaling`]: relay (session ticket) and token (bearer + heartbeat) links
//! - [`peer`]: peer connection, RTP forwarding, key-frame requests
//! - [`session`]: live and event session lifecycles
//! - [`launcher`]: request dispatch into sessions

pub mod config;
pub mod error;
pub mod launcher;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::{SignalingConfig, TurnServerConfig, WebRtcConfig};
pub use error::{Error, Result};
pub use launcher::StreamLauncher;
pub use peer::{MediaKind, MediaPacket, PeerEvent, PeerState, PeerTransport};
pub use session::{EventSession, LiveSession, SessionEnv, SessionPhase};
pub use signaling::{EndReason, IceCandidate, SignalingEvent, SignalingLink};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
