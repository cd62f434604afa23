//! Stand-in for the provider's signaling service
//!
//! Accepts WebSocket clients on a loopback port, records the upgrade request
//! and exposes each connection as a stream of decoded JSON frames.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

pub struct FakeProvider {
    pub addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<ProviderConnection>,
}

impl FakeProvider {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(conn) = ProviderConnection::accept(stream).await {
                        let _ = tx.send(conn);
                    }
                });
            }
        });
        Self { addr, connections }
    }

    /// Endpoint for the token link
    pub fn token_endpoint(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Session ticket whose relay route points at this provider
    pub fn session_ticket(&self) -> String {
        session_ticket(&json!({ "rms_fqdn": self.addr.to_string() }))
    }

    pub async fn accept(&mut self) -> ProviderConnection {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("no client connected")
            .expect("listener stopped")
    }
}

/// `header.payload.signature` with the given JSON payload
pub fn session_ticket(payload: &Value) -> String {
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#),
        URL_SAFE_NO_PAD.encode(payload.to_string()),
        URL_SAFE_NO_PAD.encode(b"sig"),
    )
}

pub fn frame(method: &str, body: Value) -> Value {
    json!({ "method": method, "dialog_id": "provider-dialog", "body": body })
}

pub struct ProviderConnection {
    pub uri: String,
    pub headers: HeaderMap,
    frames: mpsc::UnboundedReceiver<Value>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl ProviderConnection {
    async fn accept(stream: TcpStream) -> Option<Self> {
        let captured = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&captured);
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                *sink.lock() = Some((req.uri().to_string(), req.headers().clone()));
                Ok(resp)
            },
        )
        .await
        .ok()?;
        let (uri, headers) = captured.lock().take()?;

        let (mut write, mut read) = ws.split();
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if write.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            while let Some(Ok(msg)) = read.next().await {
                if let Message::Text(text) = msg {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        if frames_tx.send(value).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Some(Self {
            uri,
            headers,
            frames,
            outgoing,
        })
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Skip frames until one with `method` arrives
    pub async fn expect(&mut self, method: &str) -> Value {
        self.expect_where(method, |_| true).await
    }

    /// Skip frames until one with `method` that satisfies `accept` arrives
    pub async fn expect_where(&mut self, method: &str, accept: impl Fn(&Value) -> bool) -> Value {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.frames.recv())
                .await
                .unwrap_or_else(|_| panic!("no {} frame arrived", method))
                .unwrap_or_else(|| panic!("client disconnected before sending {}", method));
            if frame["method"] == method && accept(&frame) {
                return frame;
            }
        }
    }

    /// Next frame of any method; `None` once the client is gone
    pub async fn next_frame(&mut self) -> Option<Value> {
        self.frames.recv().await
    }

    /// Wait for the client to go away, ignoring whatever it still sends
    pub async fn disconnected(&mut self) {
        tokio::time::timeout(WAIT, async {
            while self.frames.recv().await.is_some() {}
        })
        .await
        .expect("client kept the connection open");
    }

    pub fn send(&self, frame: Value) {
        let _ = self.outgoing.send(Message::Text(frame.to_string()));
    }

    /// Close the socket from the provider side
    pub fn hang_up(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }
}
