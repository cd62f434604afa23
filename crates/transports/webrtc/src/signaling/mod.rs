//! Provider signaling links
//!
//! A link is one persistent WebSocket dialog with the provider for one
//! device. Both variants speak the same envelope protocol and report what
//! they hear as [`SignalingEvent`]s on an ordered channel.

mod channel;
pub mod protocol;
pub mod relay;
pub mod token;

pub use protocol::{EndReason, IceCandidate};
pub use relay::RelayLink;
pub use token::TokenLink;

use crate::config::SignalingConfig;
use crate::Result;
use async_trait::async_trait;
use camstream_core::{Credential, DeviceIdentity};
use tokio::sync::mpsc;

/// Event reported by a signaling link
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Remote answer to our offer
    Answer(String),
    /// Remote offer (renegotiation)
    Offer(String),
    IceCandidate(IceCandidate),
    /// Provider assigned a session id to the dialog
    SessionCreated(String),
    /// Camera side is up; the session should be activated
    CameraConnected,
    /// Link ended; always the last event
    Ended(EndReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkVariant {
    Relay,
    Token,
}

/// Operations common to both link variants
#[async_trait]
pub trait SignalingLink: Send + Sync {
    fn variant(&self) -> LinkVariant;

    /// Session id assigned by the provider, once known
    fn session_id(&self) -> Option<String>;

    /// Send the local offer, asking the provider to start the live view
    async fn send_offer(&self, sdp: &str) -> Result<()>;

    /// Answer a provider-initiated offer
    async fn submit_answer(&self, sdp: &str) -> Result<()>;

    /// Send a local ICE candidate to the remote side
    async fn submit_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    /// Send `activate_session` and `stream_options`
    async fn activate(&self) -> Result<()>;

    /// End the dialog. Repeated calls are no-ops.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Open the link variant matching the credential
pub async fn open(
    config: &SignalingConfig,
    credential: &Credential,
    identity: &DeviceIdentity,
) -> Result<(Box<dyn SignalingLink>, mpsc::UnboundedReceiver<SignalingEvent>)> {
    match credential {
        Credential::SessionTicket(ticket) => {
            let (link, events) = RelayLink::open(config, ticket, identity).await?;
            Ok((Box::new(link), events))
        }
        Credential::BearerToken(token) => {
            let (link, events) = TokenLink::open(config, token, identity).await?;
            Ok((Box::new(link), events))
        }
    }
}
