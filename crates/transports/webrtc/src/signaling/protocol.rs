//! Provider signaling message types
//!
//! Every frame is a JSON envelope `{ "method", "dialog_id", "body" }`. The
//! body shape depends on the method; bodies addressed to a device carry its
//! `doorbot_id` and, once assigned, the provider's `session_id`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Incoming/outgoing signaling envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Method name
    pub method: String,

    /// Dialog the message belongs to
    #[serde(default)]
    pub dialog_id: String,

    /// Method-specific payload
    #[serde(default)]
    pub body: Value,
}

/// ICE candidate as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: u16,
}

/// Decoded incoming message
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Remote description; `offer == true` means the provider renegotiates
    Sdp { sdp: String, offer: bool },
    Ice(IceCandidate),
    SessionCreated { session_id: String },
    SessionStarted,
    Notification { text: String },
    Close { code: Option<i64>, text: String },
    Pong,
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct SdpBody {
    sdp: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IceBody {
    ice: String,
    #[serde(default)]
    mlineindex: u16,
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    session_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationBody {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct CloseBody {
    #[serde(default)]
    reason: CloseReason,
}

#[derive(Debug, Default, Deserialize)]
struct CloseReason {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    text: String,
}

impl Envelope {
    /// Parse an envelope from a text frame
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::InvalidData(format!("bad envelope: {}", e)))
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }

    /// `body.doorbot_id` as a string, whether it was sent as a number or a string
    pub fn doorbot_id(&self) -> Option<String> {
        match self.body.get("doorbot_id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.body.get("session_id").and_then(Value::as_str)
    }

    /// Decode the body according to `method`
    pub fn decode(&self) -> Result<Incoming> {
        let body = self.body.clone();
        let incoming = match self.method.as_str() {
            "sdp" => {
                let b: SdpBody = from_body(&self.method, body)?;
                Incoming::Sdp {
                    offer: b.kind.as_deref() == Some("offer"),
                    sdp: b.sdp,
                }
            }
            "ice" => {
                let b: IceBody = from_body(&self.method, body)?;
                Incoming::Ice(IceCandidate {
                    candidate: b.ice,
                    sdp_mid: None,
                    sdp_mline_index: b.mlineindex,
                })
            }
            "session_created" => {
                let b: SessionBody = from_body(&self.method, body)?;
                Incoming::SessionCreated {
                    session_id: b.session_id,
                }
            }
            "session_started" => Incoming::SessionStarted,
            "notification" => {
                let b: NotificationBody = from_body(&self.method, body)?;
                Incoming::Notification { text: b.text }
            }
            "close" => {
                let b: CloseBody = from_body(&self.method, body)?;
                Incoming::Close {
                    code: b.reason.code,
                    text: b.reason.text,
                }
            }
            "pong" => Incoming::Pong,
            other => Incoming::Unknown(other.to_string()),
        };
        Ok(incoming)
    }
}

fn from_body<T: serde::de::DeserializeOwned>(method: &str, body: Value) -> Result<T> {
    let body = if body.is_null() { json!({}) } else { body };
    serde_json::from_value(body)
        .map_err(|e| Error::InvalidData(format!("invalid {} body: {}", method, e)))
}

/// Addressing shared by every outgoing message of one link
#[derive(Debug, Clone)]
pub struct Dialog {
    pub dialog_id: String,
    /// Device id, sent as a number when it is numeric
    pub doorbot_id: Value,
}

impl Dialog {
    pub fn new(dialog_id: impl Into<String>, device_id: &str) -> Self {
        let doorbot_id = device_id
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(device_id));
        Self {
            dialog_id: dialog_id.into(),
            doorbot_id,
        }
    }

    fn envelope(&self, method: &str, body: Value) -> Envelope {
        Envelope {
            method: method.to_string(),
            dialog_id: self.dialog_id.clone(),
            body,
        }
    }

    fn addressed(&self, session_id: Option<&str>, mut extra: Value) -> Value {
        if let Value::Object(map) = &mut extra {
            map.insert("doorbot_id".to_string(), self.doorbot_id.clone());
            if let Some(id) = session_id {
                map.insert("session_id".to_string(), Value::from(id));
            }
        }
        extra
    }

    /// Offer that asks the provider to start a live view
    pub fn live_view(&self, sdp: &str) -> Envelope {
        self.envelope(
            "live_view",
            self.addressed(
                None,
                json!({
                    "stream_options": { "audio_enabled": true, "video_enabled": true },
                    "sdp": sdp,
                }),
            ),
        )
    }

    /// Answer to a provider-initiated offer
    pub fn answer(&self, session_id: Option<&str>, sdp: &str) -> Envelope {
        self.envelope(
            "sdp",
            self.addressed(session_id, json!({ "sdp": sdp, "type": "answer" })),
        )
    }

    pub fn ice(&self, session_id: Option<&str>, candidate: &IceCandidate) -> Envelope {
        self.envelope(
            "ice",
            self.addressed(
                session_id,
                json!({ "ice": candidate.candidate, "mlineindex": candidate.sdp_mline_index }),
            ),
        )
    }

    pub fn activate_session(&self, session_id: Option<&str>) -> Envelope {
        self.envelope("activate_session", self.addressed(session_id, json!({})))
    }

    pub fn stream_options(&self, session_id: Option<&str>) -> Envelope {
        self.envelope(
            "stream_options",
            self.addressed(
                session_id,
                json!({ "audio_enabled": true, "video_enabled": true }),
            ),
        )
    }

    pub fn ping(&self, session_id: Option<&str>) -> Envelope {
        self.envelope("ping", self.addressed(session_id, json!({})))
    }

    pub fn close(&self, session_id: Option<&str>) -> Envelope {
        self.envelope(
            "close",
            self.addressed(
                session_id,
                json!({ "reason": { "code": 0, "text": "" } }),
            ),
        )
    }
}

/// Why a signaling link ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Provider sent `close`
    Remote(String),
    /// Provider closed the link because pings stopped arriving
    HeartbeatTimeout,
    /// Socket error, close frame or end of stream
    ConnectionLost(String),
    /// Closed from this side
    Local,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Remote(text) if text.is_empty() => f.write_str("closed by provider"),
            EndReason::Remote(text) => write!(f, "closed by provider: {}", text),
            EndReason::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            EndReason::ConnectionLost(detail) => write!(f, "connection lost: {}", detail),
            EndReason::Local => f.write_str("closed locally"),
        }
    }
}
