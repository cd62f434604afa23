//! WebRTC peer connection towards the camera
//!
//! Receives the camera's audio and video, re-serializes every RTP packet onto
//! a bounded channel and keeps the video decodable by asking for key frames.

use super::{MediaKind, MediaPacket, PeerEvent, PeerState};
use crate::config::WebRtcConfig;
use crate::signaling::IceCandidate;
use crate::{Error, Result};
use camstream_core::RepeatingTimer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
        }
    }
}

impl From<&IceCandidate> for RTCIceCandidateInit {
    fn from(c: &IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate.clone(),
            sdp_mid: c.sdp_mid.clone(),
            sdp_mline_index: Some(c.sdp_mline_index),
            username_fragment: None,
        }
    }
}

/// Receiving ends of a [`PeerTransport`]
pub struct PeerChannels {
    /// Received packets; full queue drops packets instead of buffering
    pub media: mpsc::Receiver<MediaPacket>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

/// Periodic picture-loss requests for the received video stream
struct KeyFrameRequests {
    pc: Weak<RTCPeerConnection>,
    media_ssrc: AtomicU32,
    interval: Duration,
    timer: Mutex<Option<RepeatingTimer>>,
    closed: AtomicBool,
}

impl KeyFrameRequests {
    /// First video packet seen: request now, then every `interval`
    fn on_first_video(self: &Arc<Self>, ssrc: u32) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        self.media_ssrc.store(ssrc, Ordering::SeqCst);
        debug!(ssrc, interval = ?self.interval, "video flowing, starting key-frame requests");

        let pc = self.pc.clone();
        tokio::spawn(async move {
            if let Some(pc) = pc.upgrade() {
                send_pli(&pc, ssrc).await;
            }
        });

        let pc = self.pc.clone();
        *timer = Some(RepeatingTimer::start(self.interval, move || {
            let pc = pc.clone();
            async move {
                match pc.upgrade() {
                    Some(pc) => {
                        send_pli(&pc, ssrc).await;
                        true
                    }
                    None => false,
                }
            }
        }));
    }

    fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
    }
}

async fn send_pli(pc: &RTCPeerConnection, media_ssrc: u32) {
    let pli = PictureLossIndication {
        sender_ssrc: 0,
        media_ssrc,
    };
    if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
        debug!(media_ssrc, "key-frame request not sent: {}", e);
    }
}

pub struct PeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
    keyframes: Arc<KeyFrameRequests>,
    closed: AtomicBool,
    close_timeout: Duration,
}

impl PeerTransport {
    /// Create the peer connection with a `sendrecv` audio and a `recvonly`
    /// video transceiver
    pub async fn new(config: &WebRtcConfig) -> Result<(Self, PeerChannels)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
            })?);

        peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| Error::PeerConnectionError(format!("audio transceiver: {}", e)))?;
        peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| Error::PeerConnectionError(format!("video transceiver: {}", e)))?;

        let (media_tx, media) = mpsc::channel(config.media_queue_depth);
        let (events_tx, events) = mpsc::unbounded_channel();

        let keyframes = Arc::new(KeyFrameRequests {
            pc: Arc::downgrade(&peer_connection),
            media_ssrc: AtomicU32::new(0),
            interval: config.keyframe_interval(),
            timer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let state_tx = events_tx.clone();
        let last_state = Arc::new(Mutex::new(PeerState::New));
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let mapped = match s {
                    RTCPeerConnectionState::New => Some(PeerState::New),
                    // transient; ICE may still recover
                    RTCPeerConnectionState::Connecting | RTCPeerConnectionState::Disconnected => {
                        Some(PeerState::Connecting)
                    }
                    RTCPeerConnectionState::Connected => Some(PeerState::Connected),
                    RTCPeerConnectionState::Failed => Some(PeerState::Failed),
                    RTCPeerConnectionState::Closed => Some(PeerState::Closed),
                    _ => None,
                };
                if let Some(new_state) = mapped {
                    let changed = {
                        let mut last = last_state.lock();
                        let changed = *last != new_state;
                        *last = new_state;
                        changed
                    };
                    if changed {
                        debug!("peer state -> {}", new_state);
                        let _ = state_tx.send(PeerEvent::ConnectionState(new_state));
                    }
                }
                Box::pin(async {})
            },
        ));

        let ice_tx = events_tx;
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = ice_tx.send(PeerEvent::LocalIceCandidate(init.into()));
                    }
                    Err(e) => warn!("could not serialize local ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let track_keyframes = Arc::clone(&keyframes);
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(MediaKind::Audio),
                    RTPCodecType::Video => Some(MediaKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    info!(kind = ?kind, ssrc = track.ssrc(), codec = %track.codec().capability.mime_type, "remote track");
                    tokio::spawn(read_track(
                        track,
                        kind,
                        media_tx.clone(),
                        Arc::clone(&track_keyframes),
                    ));
                }
                Box::pin(async {})
            },
        ));

        Ok((
            Self {
                peer_connection,
                keyframes,
                closed: AtomicBool::new(false),
                close_timeout: config.close_timeout(),
            },
            PeerChannels { media, events },
        ))
    }

    /// Create the local offer and set it as local description
    pub async fn create_offer(&self) -> Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::SdpError("No local description after setting offer".to_string())
            })?;

        Ok(local_desc.sdp)
    }

    /// Apply the remote answer to our offer
    pub async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    /// Answer a remote offer (renegotiation)
    pub async fn create_answer(&self, offer_sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::SdpError("No local description after setting answer".to_string())
            })?;

        Ok(local_desc.sdp)
    }

    pub async fn add_remote_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit::from(candidate))
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    /// Ask the camera for a key frame now; no-op until video has arrived
    pub async fn request_key_frame(&self) {
        let ssrc = self.keyframes.media_ssrc.load(Ordering::SeqCst);
        if ssrc != 0 && !self.is_closed() {
            send_pli(&self.peer_connection, ssrc).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection. Repeated calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.keyframes.stop();

        match tokio::time::timeout(self.close_timeout, self.peer_connection.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::PeerConnectionError(format!(
                "Failed to close connection: {}",
                e
            ))),
            Err(_) => Err(Error::OperationTimeout(format!(
                "peer connection close exceeded {:?}",
                self.close_timeout
            ))),
        }
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        self.keyframes.stop();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pc = Arc::clone(&self.peer_connection);
            handle.spawn(async move {
                let _ = pc.close().await;
            });
        }
    }
}

/// Forward one remote track until it ends or the consumer goes away
async fn read_track(
    track: Arc<TrackRemote>,
    kind: MediaKind,
    media: mpsc::Sender<MediaPacket>,
    keyframes: Arc<KeyFrameRequests>,
) {
    let mut dropped: u64 = 0;
    let mut first = true;

    loop {
        let packet = match track.read_rtp().await {
            Ok((packet, _)) => packet,
            Err(e) => {
                debug!(kind = ?kind, "track ended: {}", e);
                break;
            }
        };

        if first && kind == MediaKind::Video {
            keyframes.on_first_video(track.ssrc());
        }
        first = false;

        let payload = match packet.marshal() {
            Ok(payload) => payload,
            Err(e) => {
                debug!(kind = ?kind, "could not serialize RTP packet: {}", e);
                continue;
            }
        };

        match media.try_send(MediaPacket { kind, payload }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                dropped += 1;
                if dropped.is_power_of_two() {
                    warn!(kind = ?kind, dropped, "media queue full, dropping packets");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}
