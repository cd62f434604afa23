//! Live view: provider signaling + WebRTC peer + transcoder fed over loopback UDP

use super::state::{PhaseTracker, SessionPhase};
use super::{describe_exit, SessionEnv};
use crate::peer::{MediaKind, MediaPacket, PeerChannels, PeerEvent, PeerState, PeerTransport};
use crate::signaling::{self, EndReason, IceCandidate, SignalingEvent, SignalingLink};
use crate::{Error, Result};
use camstream_core::sdp::{transcoder_sdp, MediaPorts};
use camstream_core::{
    Credential, DeviceIdentity, ExitReason, PortReservation, SessionContext, SessionOutcome,
    TranscodeJob, TranscoderProcess,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything a live session may hold; released by [`Resources::release`]
#[derive(Default)]
struct Resources {
    ports: Option<PortReservation>,
    peer: Option<PeerTransport>,
    link: Option<Box<dyn SignalingLink>>,
    transcoder: Option<TranscoderProcess>,
    forwarder: Option<JoinHandle<()>>,
}

impl Resources {
    /// Close the link, the peer and the transcoder, then give the ports back.
    /// Each part is released at most once.
    async fn release(&mut self, device_id: &str, grace: Duration) {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.close().await {
                debug!(device_id = %device_id, "closing signaling link: {}", e);
            }
        }
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                warn!(device_id = %device_id, "closing peer connection: {}", e);
            }
        }
        if let Some(transcoder) = self.transcoder.take() {
            let exit = transcoder.stop(grace).await;
            debug!(device_id = %device_id, exit = %exit, "transcoder stopped");
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(ports) = self.ports.take() {
            ports.release();
        }
    }
}

pub struct LiveSession {
    env: Arc<SessionEnv>,
    identity: DeviceIdentity,
    credential: Credential,
    output_target: String,
    phase: PhaseTracker,
}

impl LiveSession {
    pub fn new(
        env: Arc<SessionEnv>,
        identity: DeviceIdentity,
        credential: Credential,
        output_target: impl Into<String>,
    ) -> Self {
        let phase = PhaseTracker::new(identity.id.as_str());
        Self {
            env,
            identity,
            credential,
            output_target: output_target.into(),
            phase,
        }
    }

    /// Run until stopped or until the link, the peer or the transcoder ends
    pub async fn run(mut self, ctx: SessionContext) -> SessionOutcome {
        info!(
            device_id = %self.identity.id,
            name = %self.identity.display_name,
            session_id = %ctx.session_id(),
            credential = self.credential.kind(),
            "starting live session"
        );

        let mut resources = Resources::default();
        let result = self.drive(&ctx, &mut resources).await;
        debug!(device_id = %self.identity.id, phase = %self.phase.current(), "tearing down live session");
        if result.is_ok() {
            self.phase.advance(SessionPhase::Ending);
        }
        resources
            .release(self.identity.id.as_str(), self.env.transcoder.stop_grace())
            .await;

        match result {
            Ok(reason) => {
                self.phase.advance(SessionPhase::Ended);
                info!(device_id = %self.identity.id, reason = %reason, "live session ended");
                SessionOutcome::completed(reason)
            }
            Err(e) => {
                self.phase.advance(SessionPhase::Failed);
                warn!(device_id = %self.identity.id, class = ?e.class(), "live session failed: {}", e);
                SessionOutcome::failed(e)
            }
        }
    }

    async fn drive(&mut self, ctx: &SessionContext, res: &mut Resources) -> Result<String> {
        let mut stop = ctx.stop_signal();
        let env = Arc::clone(&self.env);

        let reservation = tokio::select! {
            reserved = env.ports.reserve(2) => reserved?,
            _ = stop.wait() => return Ok("stopped before negotiation".to_string()),
        };
        let media_ports = match (reservation.get(0), reservation.get(1)) {
            (Some(audio), Some(video)) => MediaPorts { audio, video },
            _ => {
                return Err(Error::Core(camstream_core::Error::InternalError(
                    "reservation returned fewer than two ports".to_string(),
                )))
            }
        };
        debug!(device_id = %self.identity.id, audio = media_ports.audio, video = media_ports.video, "ports reserved");
        res.ports = Some(reservation);

        let (peer, PeerChannels { media, mut events }) = PeerTransport::new(&env.webrtc).await?;
        let peer = &*res.peer.insert(peer);

        let (link, mut link_events) = tokio::select! {
            opened = signaling::open(&env.webrtc.signaling, &self.credential, &self.identity) => opened?,
            _ = stop.wait() => return Ok("stopped before negotiation".to_string()),
        };
        let link = &**res.link.insert(link);

        let offer = peer.create_offer().await?;
        link.send_offer(&offer).await?;
        self.phase.advance(SessionPhase::Negotiating);
        info!(device_id = %self.identity.id, variant = ?link.variant(), "offer sent");

        // candidates are held back in both directions until the answer is applied
        let mut remote_candidates: Vec<IceCandidate> = Vec::new();
        let mut local_candidates: Vec<IceCandidate> = Vec::new();
        let mut camera_connected = false;
        let negotiation_timeout = env.webrtc.negotiation_timeout();
        let deadline = tokio::time::sleep(negotiation_timeout);
        tokio::pin!(deadline);

        let answer = loop {
            tokio::select! {
                _ = stop.wait() => return Ok("stopped during negotiation".to_string()),
                _ = &mut deadline => {
                    return Err(Error::OperationTimeout(format!(
                        "no answer within {:?}",
                        negotiation_timeout
                    )));
                }
                event = link_events.recv() => match event {
                    Some(SignalingEvent::Answer(sdp)) => break sdp,
                    Some(SignalingEvent::IceCandidate(c)) => remote_candidates.push(c),
                    Some(SignalingEvent::CameraConnected) => camera_connected = true,
                    Some(SignalingEvent::SessionCreated(id)) => {
                        debug!(device_id = %self.identity.id, provider_session = %id, "session created");
                    }
                    Some(SignalingEvent::Offer(_)) => {
                        debug!(device_id = %self.identity.id, "ignoring remote offer before answer");
                    }
                    Some(SignalingEvent::Ended(reason)) => return Err(ended_error(reason, "before answer")),
                    None => return Err(Error::LinkClosed("event channel closed before answer".to_string())),
                },
                event = events.recv() => match event {
                    Some(PeerEvent::LocalIceCandidate(c)) => local_candidates.push(c),
                    Some(PeerEvent::ConnectionState(s)) if s.is_terminal() => {
                        return Err(Error::PeerConnectionError(format!("peer connection {} before answer", s)));
                    }
                    Some(PeerEvent::ConnectionState(_)) => {}
                    None => return Err(Error::PeerConnectionError("peer events closed before answer".to_string())),
                },
            }
        };

        peer.accept_answer(&answer).await?;
        for candidate in remote_candidates.drain(..) {
            if let Err(e) = peer.add_remote_ice_candidate(&candidate).await {
                warn!(device_id = %self.identity.id, "{}", e);
            }
        }
        for candidate in local_candidates.drain(..) {
            link.submit_ice_candidate(&candidate).await?;
        }
        self.phase.advance(SessionPhase::Answered);
        info!(device_id = %self.identity.id, "answer applied");
        if camera_connected {
            self.activate(peer, link).await;
        }

        let input_sdp = transcoder_sdp(&answer, media_ports)?;
        let job = TranscodeJob::live(
            &env.transcoder,
            input_sdp,
            &self.output_target,
            self.identity.id.as_str(),
        );
        let transcoder = TranscoderProcess::spawn(job, env.transcoder.stop_grace()).await?;
        let transcoder = &*res.transcoder.insert(transcoder);

        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        res.forwarder = Some(tokio::spawn(forward_media(socket, media, media_ports)));

        self.phase.advance(SessionPhase::Active);
        ctx.report_active();
        info!(device_id = %self.identity.id, pid = ?transcoder.pid(), "live session active");

        loop {
            tokio::select! {
                _ = stop.wait() => return Ok("stop requested".to_string()),
                exit = transcoder.wait() => {
                    return match exit {
                        ExitReason::Normal => Ok("transcoder exited".to_string()),
                        other => Err(Error::Core(camstream_core::Error::TranscoderError(
                            describe_exit(other, transcoder.last_error_line()),
                        ))),
                    };
                }
                event = link_events.recv() => match event {
                    Some(SignalingEvent::Ended(reason)) => return Ok(format!("signaling {}", reason)),
                    None => return Ok("signaling closed".to_string()),
                    Some(SignalingEvent::IceCandidate(c)) => {
                        if let Err(e) = peer.add_remote_ice_candidate(&c).await {
                            warn!(device_id = %self.identity.id, "{}", e);
                        }
                    }
                    Some(SignalingEvent::Offer(sdp)) => {
                        let answer = peer.create_answer(&sdp).await?;
                        link.submit_answer(&answer).await?;
                        info!(device_id = %self.identity.id, "renegotiated with provider offer");
                    }
                    Some(SignalingEvent::CameraConnected) => self.activate(peer, link).await,
                    Some(SignalingEvent::Answer(_)) => {
                        debug!(device_id = %self.identity.id, "ignoring repeated answer");
                    }
                    Some(SignalingEvent::SessionCreated(id)) => {
                        debug!(device_id = %self.identity.id, provider_session = %id, "session created");
                    }
                },
                event = events.recv() => match event {
                    Some(PeerEvent::LocalIceCandidate(c)) => {
                        if let Err(e) = link.submit_ice_candidate(&c).await {
                            debug!(device_id = %self.identity.id, "local candidate not sent: {}", e);
                        }
                    }
                    Some(PeerEvent::ConnectionState(PeerState::Connected)) => {
                        info!(device_id = %self.identity.id, "peer connected");
                    }
                    Some(PeerEvent::ConnectionState(s)) if s.is_terminal() => {
                        return Ok(format!("peer connection {}", s));
                    }
                    Some(PeerEvent::ConnectionState(s)) => {
                        debug!(device_id = %self.identity.id, state = %s, "peer state");
                    }
                    None => return Ok("peer transport closed".to_string()),
                },
            }
        }
    }

    async fn activate(&self, peer: &PeerTransport, link: &dyn SignalingLink) {
        info!(device_id = %self.identity.id, "camera connected, activating");
        peer.request_key_frame().await;
        if let Err(e) = link.activate().await {
            warn!(device_id = %self.identity.id, "activation not sent: {}", e);
        }
    }
}

fn ended_error(reason: EndReason, when: &str) -> Error {
    match reason {
        EndReason::HeartbeatTimeout => {
            Error::HeartbeatTimeout(format!("provider stopped the link {}", when))
        }
        other => Error::LinkClosed(format!("{} {}", other, when)),
    }
}

/// Send every received packet to the transcoder port for its kind
async fn forward_media(socket: UdpSocket, mut media: mpsc::Receiver<MediaPacket>, ports: MediaPorts) {
    let mut forwarded: u64 = 0;
    while let Some(packet) = media.recv().await {
        let port = match packet.kind {
            MediaKind::Audio => ports.audio,
            MediaKind::Video => ports.video,
        };
        match socket.send_to(&packet.payload, (Ipv4Addr::LOCALHOST, port)).await {
            Ok(_) => forwarded += 1,
            Err(e) => debug!(port, "forward failed: {}", e),
        }
    }
    debug!(forwarded, "media forwarder finished");
}
