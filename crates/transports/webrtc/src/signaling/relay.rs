//! Relay link: session-ticket credential, provider relay host taken from the ticket

use super::channel::{build_request, WsChannel};
use super::protocol::{EndReason, IceCandidate};
use super::{LinkVariant, SignalingEvent, SignalingLink};
use crate::config::SignalingConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use camstream_core::DeviceIdentity;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

const DEFAULT_RELAY_PORT: u16 = 443;

/// Relay host named by a session ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct TicketPayload {
    rms_fqdn: String,
    #[serde(default)]
    rms_port: Option<u16>,
}

/// Read the relay endpoint out of a `header.payload.signature` ticket
pub fn parse_session_ticket(ticket: &str) -> Result<RelayEndpoint> {
    let segments: Vec<&str> = ticket.split('.').collect();
    if segments.len() != 3 {
        return Err(Error::InvalidCredential(format!(
            "session ticket has {} segments, expected 3",
            segments.len()
        )));
    }

    let encoded = segments[1].trim_end_matches('=');
    let decoded = URL_SAFE_NO_PAD
        .decode(encoded)
        .or_else(|_| STANDARD_NO_PAD.decode(encoded))
        .map_err(|e| Error::InvalidCredential(format!("ticket payload is not base64: {}", e)))?;
    let payload: TicketPayload = serde_json::from_slice(&decoded)
        .map_err(|e| Error::InvalidCredential(format!("ticket payload: {}", e)))?;

    let (host, embedded_port) = match payload.rms_fqdn.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (payload.rms_fqdn.clone(), None),
        },
        None => (payload.rms_fqdn.clone(), None),
    };
    if host.is_empty() {
        return Err(Error::InvalidCredential("ticket names no relay host".to_string()));
    }

    Ok(RelayEndpoint {
        host,
        port: embedded_port
            .or(payload.rms_port)
            .unwrap_or(DEFAULT_RELAY_PORT),
    })
}

/// `{scheme}://host:port/?api_version=…&auth_type=session_ticket&client_id=…&token=…`
pub fn relay_url(config: &SignalingConfig, endpoint: &RelayEndpoint, ticket: &str) -> Result<Url> {
    let mut url = Url::parse(&format!(
        "{}://{}:{}/",
        config.relay_scheme, endpoint.host, endpoint.port
    ))
    .map_err(|e| Error::InvalidCredential(format!("relay url: {}", e)))?;
    url.query_pairs_mut()
        .append_pair("api_version", &config.api_version)
        .append_pair("auth_type", "session_ticket")
        .append_pair(
            "client_id",
            &format!("{}-{}", config.client_type, uuid::Uuid::new_v4()),
        )
        .append_pair("token", ticket);
    Ok(url)
}

fn classify_close(text: &str) -> EndReason {
    EndReason::Remote(text.to_string())
}

pub struct RelayLink {
    channel: WsChannel,
}

impl RelayLink {
    pub async fn open(
        config: &SignalingConfig,
        ticket: &str,
        identity: &DeviceIdentity,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let endpoint = parse_session_ticket(ticket)?;
        debug!(device_id = %identity.id, host = %endpoint.host, port = endpoint.port, "opening relay link");
        let url = relay_url(config, &endpoint, ticket)?;
        let request = build_request(url.as_str(), config, None)?;
        let (channel, events) = WsChannel::connect(
            request,
            config.open_timeout(),
            identity.id.as_str(),
            classify_close,
        )
        .await?;
        Ok((Self { channel }, events))
    }
}

#[async_trait]
impl SignalingLink for RelayLink {
    fn variant(&self) -> LinkVariant {
        LinkVariant::Relay
    }

    fn session_id(&self) -> Option<String> {
        self.channel.session_id()
    }

    async fn send_offer(&self, sdp: &str) -> Result<()> {
        self.channel.send(self.channel.dialog().live_view(sdp))
    }

    async fn submit_answer(&self, sdp: &str) -> Result<()> {
        let session_id = self.channel.session_id();
        self.channel
            .send(self.channel.dialog().answer(session_id.as_deref(), sdp))
    }

    async fn submit_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let session_id = self.channel.session_id();
        self.channel
            .send(self.channel.dialog().ice(session_id.as_deref(), candidate))
    }

    async fn activate(&self) -> Result<()> {
        let session_id = self.channel.session_id();
        let dialog = self.channel.dialog();
        self.channel.send(dialog.activate_session(session_id.as_deref()))?;
        self.channel.send(dialog.stream_options(session_id.as_deref()))
    }

    async fn close(&self) -> Result<()> {
        self.channel.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}
