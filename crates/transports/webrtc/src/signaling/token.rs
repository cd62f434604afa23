//! Token link: bearer-token credential against the fixed signaling endpoint,
//! kept alive with an application-level ping

use super::channel::{build_request, WsChannel};
use super::protocol::{EndReason, IceCandidate};
use super::{LinkVariant, SignalingEvent, SignalingLink};
use crate::config::SignalingConfig;
use crate::Result;
use async_trait::async_trait;
use camstream_core::{DeviceIdentity, RepeatingTimer};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

const HEARTBEAT_TIMEOUT_TEXT: &str = "timeout waiting for ping";

fn classify_close(text: &str) -> EndReason {
    if text.to_ascii_lowercase().contains(HEARTBEAT_TIMEOUT_TEXT) {
        EndReason::HeartbeatTimeout
    } else {
        EndReason::Remote(text.to_string())
    }
}

pub struct TokenLink {
    channel: WsChannel,
    heartbeat: Mutex<Option<RepeatingTimer>>,
}

impl TokenLink {
    pub async fn open(
        config: &SignalingConfig,
        token: &str,
        identity: &DeviceIdentity,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let request = build_request(&config.token_endpoint, config, Some(token))?;
        let (channel, events) = WsChannel::connect(
            request,
            config.open_timeout(),
            identity.id.as_str(),
            classify_close,
        )
        .await?;

        let pinger = channel.pinger();
        let heartbeat = RepeatingTimer::start(config.heartbeat_interval(), move || {
            std::future::ready(pinger.ping())
        });
        debug!(device_id = %identity.id, interval = ?config.heartbeat_interval(), "heartbeat started");

        Ok((
            Self {
                channel,
                heartbeat: Mutex::new(Some(heartbeat)),
            },
            events,
        ))
    }

    fn stop_heartbeat(&self) {
        if let Some(timer) = self.heartbeat.lock().take() {
            timer.cancel();
        }
    }
}

#[async_trait]
impl SignalingLink for TokenLink {
    fn variant(&self) -> LinkVariant {
        LinkVariant::Token
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
        self.stop_heartbeat();
        self.channel.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_close_is_classified() {
        assert_eq!(
            classify_close("Timeout waiting for ping from client"),
            EndReason::HeartbeatTimeout
        );
        assert_eq!(
            classify_close("session ended"),
            EndReason::Remote("session ended".to_string())
        );
    }
}
