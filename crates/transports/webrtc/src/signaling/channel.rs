//! WebSocket plumbing shared by both link variants
//!
//! One sender task drains an unbounded queue into the socket, one receiver
//! task filters and decodes incoming envelopes into [`SignalingEvent`]s. The
//! link ends exactly once, whichever side notices first.

use super::protocol::{Dialog, EndReason, Envelope, Incoming};
use super::SignalingEvent;
use crate::config::SignalingConfig;
use crate::{Error, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Maps the reason text of a remote `close` to an [`EndReason`]
pub(crate) type CloseClassifier = fn(&str) -> EndReason;

/// Build the upgrade request with client identification headers
pub(crate) fn build_request(
    url: &str,
    config: &SignalingConfig,
    bearer: Option<&str>,
) -> Result<Request> {
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(USER_AGENT, header_value(&config.user_agent)?);
    headers.insert(
        HeaderName::from_static("x-client-type"),
        header_value(&config.client_type)?,
    );
    headers.insert(
        HeaderName::from_static("x-client-version"),
        header_value(&config.client_version)?,
    );
    if let Some(token) = bearer {
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
    }
    Ok(request)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::InvalidConfig(format!("invalid header value: {}", e)))
}

struct Shared {
    device_id: String,
    session_id: Mutex<Option<String>>,
    ended: AtomicBool,
    events: mpsc::UnboundedSender<SignalingEvent>,
    classify_close: CloseClassifier,
}

impl Shared {
    /// End the link; only the first call emits [`SignalingEvent::Ended`]
    fn terminate(&self, reason: EndReason) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(device_id = %self.device_id, reason = %reason, "signaling link ended");
        let _ = self.events.send(SignalingEvent::Ended(reason));
    }

    fn dispatch(&self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(device_id = %self.device_id, "dropping undecodable signaling frame: {}", e);
                return;
            }
        };

        if let Some(doorbot_id) = envelope.doorbot_id() {
            if doorbot_id != self.device_id {
                debug!(device_id = %self.device_id, other = %doorbot_id, method = %envelope.method, "dropping message for another device");
                return;
            }
        }
        if let (Some(theirs), Some(ours)) = (envelope.session_id(), self.session_id.lock().clone()) {
            if theirs != ours {
                debug!(device_id = %self.device_id, session_id = %theirs, method = %envelope.method, "dropping message for another session");
                return;
            }
        }

        let incoming = match envelope.decode() {
            Ok(incoming) => incoming,
            Err(e) => {
                warn!(device_id = %self.device_id, "{}", e);
                return;
            }
        };

        let event = match incoming {
            Incoming::Sdp { sdp, offer: true } => SignalingEvent::Offer(sdp),
            Incoming::Sdp { sdp, offer: false } => SignalingEvent::Answer(sdp),
            Incoming::Ice(candidate) => SignalingEvent::IceCandidate(candidate),
            Incoming::SessionCreated { session_id } => {
                let mut current = self.session_id.lock();
                if current.is_none() {
                    *current = Some(session_id.clone());
                }
                SignalingEvent::SessionCreated(session_id)
            }
            Incoming::SessionStarted => SignalingEvent::CameraConnected,
            Incoming::Notification { text } if text.contains("camera_connected") => {
                SignalingEvent::CameraConnected
            }
            Incoming::Notification { text } => {
                debug!(device_id = %self.device_id, text = %text, "notification");
                return;
            }
            Incoming::Close { code, text } => {
                debug!(device_id = %self.device_id, code = ?code, "provider closed the dialog");
                self.terminate((self.classify_close)(&text));
                return;
            }
            Incoming::Pong => {
                debug!(device_id = %self.device_id, "pong");
                return;
            }
            Incoming::Unknown(method) => {
                debug!(device_id = %self.device_id, method = %method, "ignoring unknown signaling method");
                return;
            }
        };

        if self.ended.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(event);
    }
}

/// Connected duplex signaling channel
pub(crate) struct WsChannel {
    dialog: Dialog,
    outgoing: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
    receiver: JoinHandle<()>,
}

impl WsChannel {
    /// Connect and start the sender/receiver tasks
    pub(crate) async fn connect(
        request: Request,
        open_timeout: Duration,
        device_id: &str,
        classify_close: CloseClassifier,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let host = request.uri().host().unwrap_or_default().to_string();
        info!(device_id = %device_id, host = %host, "connecting to signaling server");

        let (ws_stream, _) = tokio::time::timeout(open_timeout, connect_async(request))
            .await
            .map_err(|_| {
                Error::OperationTimeout(format!(
                    "signaling connect to {} exceeded {:?}",
                    host, open_timeout
                ))
            })?
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!(device_id = %device_id, "connected to signaling server");

        let (write, read) = ws_stream.split();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            device_id: device_id.to_string(),
            session_id: Mutex::new(None),
            ended: AtomicBool::new(false),
            events: events_tx,
            classify_close,
        });

        tokio::spawn(sender_task(write, outgoing_rx, Arc::clone(&shared)));
        let receiver = tokio::spawn(receiver_task(read, Arc::clone(&shared)));

        Ok((
            Self {
                dialog: Dialog::new(uuid::Uuid::new_v4().to_string(), device_id),
                outgoing,
                shared,
                receiver,
            },
            events_rx,
        ))
    }

    pub(crate) fn dialog(&self) -> &Dialog {
        &self.dialog
    }

    pub(crate) fn session_id(&self) -> Option<String> {
        self.shared.session_id.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.ended.load(Ordering::SeqCst)
    }

    /// Queue an envelope for sending
    pub(crate) fn send(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(Error::LinkClosed(format!(
                "cannot send {} on an ended link",
                envelope.method
            )));
        }
        let text = envelope.to_json()?;
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| Error::LinkClosed("sender task is gone".to_string()))
    }

    /// Send `close`, close the socket and end the link. Repeated calls are no-ops.
    pub(crate) fn close(&self) {
        if self.is_closed() {
            return;
        }
        let session_id = self.session_id();
        if let Ok(text) = self.dialog.close(session_id.as_deref()).to_json() {
            let _ = self.outgoing.send(Message::Text(text));
        }
        let _ = self.outgoing.send(Message::Close(None));
        self.shared.terminate(EndReason::Local);
    }

    /// Handle for periodic pings that does not keep the link alive
    pub(crate) fn pinger(&self) -> Pinger {
        Pinger {
            dialog: self.dialog.clone(),
            outgoing: self.outgoing.clone(),
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Sends `ping` for a link until it ends
pub(crate) struct Pinger {
    dialog: Dialog,
    outgoing: mpsc::UnboundedSender<Message>,
    shared: Weak<Shared>,
}

impl Pinger {
    /// Send one ping; `false` once the link is gone
    pub(crate) fn ping(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        if shared.ended.load(Ordering::SeqCst) {
            return false;
        }
        let session_id = shared.session_id.lock().clone();
        match self.dialog.ping(session_id.as_deref()).to_json() {
            Ok(text) => self.outgoing.send(Message::Text(text)).is_ok(),
            Err(_) => false,
        }
    }
}

/// Sender task: sends queued messages to the socket
async fn sender_task(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            error!(device_id = %shared.device_id, "Failed to send WebSocket message: {}", e);
            shared.terminate(EndReason::ConnectionLost(e.to_string()));
            break;
        }
        if closing {
            break;
        }
    }

    debug!(device_id = %shared.device_id, "Sender task terminated");
}

/// Receiver task: decodes frames until the socket ends
async fn receiver_task(mut read: SplitStream<WsStream>, shared: Arc<Shared>) {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => shared.dispatch(&text),
            Ok(Message::Close(frame)) => {
                let detail = frame
                    .map(|f| format!("websocket closed ({} {})", f.code, f.reason))
                    .unwrap_or_else(|| "websocket closed".to_string());
                shared.terminate(EndReason::ConnectionLost(detail));
                break;
            }
            Err(e) => {
                shared.terminate(EndReason::ConnectionLost(e.to_string()));
                break;
            }
            _ => {}
        }
    }

    shared.terminate(EndReason::ConnectionLost("end of stream".to_string()));
    debug!(device_id = %shared.device_id, "Receiver task terminated");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> (Shared, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Shared {
                device_id: "42".to_string(),
                session_id: Mutex::new(None),
                ended: AtomicBool::new(false),
                events,
                classify_close: |text| EndReason::Remote(text.to_string()),
            },
            rx,
        )
    }

    #[test]
    fn test_dispatch_filters_foreign_devices_and_sessions() {
        let (shared, mut rx) = shared();
        shared.dispatch(r#"{"method":"session_created","body":{"doorbot_id":42,"session_id":"s1"}}"#);
        shared.dispatch(r#"{"method":"sdp","body":{"doorbot_id":7,"sdp":"v=0","type":"answer"}}"#);
        shared.dispatch(r#"{"method":"sdp","body":{"doorbot_id":42,"session_id":"s2","sdp":"v=0","type":"answer"}}"#);
        shared.dispatch(r#"{"method":"sdp","body":{"doorbot_id":42,"session_id":"s1","sdp":"v=1","type":"answer"}}"#);

        assert_eq!(
            rx.try_recv().unwrap(),
            SignalingEvent::SessionCreated("s1".into())
        );
        assert_eq!(rx.try_recv().unwrap(), SignalingEvent::Answer("v=1".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_camera_connected_variants() {
        let (shared, mut rx) = shared();
        shared.dispatch(r#"{"method":"notification","body":{"text":"camera_connected"}}"#);
        shared.dispatch(r#"{"method":"notification","body":{"text":"something else"}}"#);
        shared.dispatch(r#"{"method":"session_started","body":{}}"#);
        assert_eq!(rx.try_recv().unwrap(), SignalingEvent::CameraConnected);
        assert_eq!(rx.try_recv().unwrap(), SignalingEvent::CameraConnected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_terminate_emits_once_and_silences_later_events() {
        let (shared, mut rx) = shared();
        shared.dispatch(r#"{"method":"close","body":{"reason":{"code":1,"text":"bye"}}}"#);
        shared.terminate(EndReason::Local);
        shared.dispatch(r#"{"method":"sdp","body":{"sdp":"v=0","type":"answer"}}"#);

        assert_eq!(
            rx.try_recv().unwrap(),
            SignalingEvent::Ended(EndReason::Remote("bye".into()))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_build_request_headers() {
        let config = SignalingConfig::default();
        let request = build_request("ws://127.0.0.1:9/ws", &config, Some("abc")).unwrap();
        let headers = request.headers();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer abc");
        assert_eq!(
            headers.get("x-client-type").unwrap().to_str().unwrap(),
            config.client_type
        );
        assert!(headers.get(USER_AGENT).is_some());
        assert!(headers.get("x-client-version").is_some());

        let relay = build_request("ws://127.0.0.1:9/", &config, None).unwrap();
        assert!(relay.headers().get(AUTHORIZATION).is_none());
    }
}
