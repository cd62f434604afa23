//! Camera-side peer answering live-view offers
//!
//! Once started it streams placeholder H264 and Opus frames and counts the
//! picture-loss requests that reach its video sender.

use bytes::Bytes;
use camstream_webrtc::IceCandidate;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const FRAME: Duration = Duration::from_millis(33);

/// IDR slice NAL unit; enough for the packetizer, not a decodable picture
const VIDEO_FRAME: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00, 0x33, 0xff, 0x10, 0x20];

pub struct FakeCamera {
    pc: Arc<RTCPeerConnection>,
    video: Arc<TrackLocalStaticSample>,
    audio: Arc<TrackLocalStaticSample>,
    pli_received: Arc<AtomicUsize>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FakeCamera {
    /// Accept `offer` and return the camera with its complete answer
    /// (candidates included)
    pub async fn answer(offer: &str) -> (Self, String) {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine).unwrap();
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );

        let track = |mime: &str, id: &str| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime.to_owned(),
                    ..Default::default()
                },
                id.to_owned(),
                "camera".to_owned(),
            ))
        };
        let video = track(MIME_TYPE_H264, "video");
        let audio = track(MIME_TYPE_OPUS, "audio");

        let pli_received = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        let video_sender = pc
            .add_track(Arc::clone(&video) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .unwrap();
        tasks.push(tokio::spawn(count_pli(
            video_sender,
            Some(Arc::clone(&pli_received)),
        )));
        let audio_sender = pc
            .add_track(Arc::clone(&audio) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .unwrap();
        tasks.push(tokio::spawn(count_pli(audio_sender, None)));

        pc.set_remote_description(RTCSessionDescription::offer(offer.to_string()).unwrap())
            .await
            .unwrap();
        let answer = pc.create_answer(None).await.unwrap();
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await.unwrap();
        let _ = gathered.recv().await;
        let sdp = pc.local_description().await.unwrap().sdp;

        (
            Self {
                pc,
                video,
                audio,
                pli_received,
                tasks: Mutex::new(tasks),
            },
            sdp,
        )
    }

    /// Apply a trickled `ice` frame from the client
    pub async fn add_candidate(&self, frame: &Value) {
        let body = &frame["body"];
        let init = RTCIceCandidateInit {
            candidate: body["ice"].as_str().unwrap_or_default().to_string(),
            sdp_mline_index: body["mlineindex"].as_u64().map(|i| i as u16),
            ..Default::default()
        };
        let _ = self.pc.add_ice_candidate(init).await;
    }

    /// Apply a candidate handed over directly by a local peer
    pub async fn add_ice(&self, candidate: &IceCandidate) {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            ..Default::default()
        };
        let _ = self.pc.add_ice_candidate(init).await;
    }

    /// Stream a video and an audio frame every 33 ms until closed
    pub fn start_media(&self) {
        let video = Arc::clone(&self.video);
        let audio = Arc::clone(&self.audio);
        self.tasks.lock().push(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(FRAME);
            loop {
                ticks.tick().await;
                let _ = video
                    .write_sample(&Sample {
                        data: Bytes::from_static(VIDEO_FRAME),
                        duration: FRAME,
                        ..Default::default()
                    })
                    .await;
                let _ = audio
                    .write_sample(&Sample {
                        data: Bytes::from(vec![0xfc; 40]),
                        duration: FRAME,
                        ..Default::default()
                    })
                    .await;
            }
        }));
    }

    /// Picture-loss requests received on the video sender so far
    pub fn pli_received(&self) -> usize {
        self.pli_received.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let _ = self.pc.close().await;
    }
}

/// Drain a sender's RTCP, counting picture-loss requests when asked to
async fn count_pli(sender: Arc<RTCRtpSender>, counter: Option<Arc<AtomicUsize>>) {
    while let Ok((packets, _)) = sender.read_rtcp().await {
        let Some(counter) = &counter else { continue };
        for packet in packets {
            if packet
                .as_any()
                .downcast_ref::<PictureLossIndication>()
                .is_some()
            {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}
