//! Start/stop commands and the state vocabulary reported back to callers
//!
//! Commands arrive as JSON objects tagged by `command`:
//!
//! ```json
//! {"command":"start","deviceId":"cam-1","deviceDisplayName":"Porch",
//!  "credential":{"sessionTicket":"..."},"outputTarget":"rtsp://127.0.0.1:8554/cam-1_live"}
//! {"command":"stop","deviceId":"cam-1"}
//! ```

use crate::config::OutputConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider-assigned device identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Device id plus the human-readable name used in logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: DeviceId,
    pub display_name: String,
}

/// Credential presented to the provider's signaling service.
///
/// The variant decides which signaling link is opened.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Credential {
    /// Opaque ticket with an embedded relay route
    SessionTicket(String),
    /// Account bearer token for the fixed signaling endpoint
    BearerToken(String),
}

impl Credential {
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::SessionTicket(_) => "session_ticket",
            Credential::BearerToken(_) => "bearer_token",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential::{}(<redacted>)", self.kind())
    }
}

/// Which restream a session produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Live view negotiated over WebRTC
    #[default]
    Live,
    /// Stored event recording relayed through the transcoder
    Event,
}

impl StreamKind {
    /// Path suffix used for the RTSP output target
    pub fn path_suffix(&self) -> &'static str {
        match self {
            StreamKind::Live => "_live",
            StreamKind::Event => "_event",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Live => f.write_str("live"),
            StreamKind::Event => f.write_str("event"),
        }
    }
}

/// Where a session's media comes from, resolved from a [`StartRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSource {
    Live(Credential),
    Recording { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub device_id: DeviceId,

    #[serde(default, rename = "deviceDisplayName")]
    pub device_name: String,

    #[serde(default)]
    pub kind: StreamKind,

    /// Required for live sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,

    /// Required for event sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_url: Option<String>,

    /// RTSP publish URL; filled from [`OutputConfig`] when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_target: Option<String>,
}

impl StartRequest {
    pub fn live(device_id: impl Into<String>, credential: Credential, output_target: &str) -> Self {
        Self {
            device_id: DeviceId::new(device_id),
            device_name: String::new(),
            kind: StreamKind::Live,
            credential: Some(credential),
            recording_url: None,
            output_target: Some(output_target.to_string()),
        }
    }

    pub fn event(device_id: impl Into<String>, recording_url: &str, output_target: &str) -> Self {
        Self {
            device_id: DeviceId::new(device_id),
            device_name: String::new(),
            kind: StreamKind::Event,
            credential: None,
            recording_url: Some(recording_url.to_string()),
            output_target: Some(output_target.to_string()),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        let display_name = if self.device_name.is_empty() {
            self.device_id.to_string()
        } else {
            self.device_name.clone()
        };
        DeviceIdentity {
            id: self.device_id.clone(),
            display_name,
        }
    }

    /// Resolve the media source for this request's kind
    pub fn source(&self) -> Result<SessionSource> {
        match self.kind {
            StreamKind::Live => self
                .credential
                .clone()
                .map(SessionSource::Live)
                .ok_or_else(|| {
                    Error::InvalidRequest(format!(
                        "live start for {} carries no credential",
                        self.device_id
                    ))
                }),
            StreamKind::Event => self
                .recording_url
                .clone()
                .filter(|url| !url.is_empty())
                .map(|url| SessionSource::Recording { url })
                .ok_or_else(|| {
                    Error::InvalidRequest(format!(
                        "event start for {} carries no recordingUrl",
                        self.device_id
                    ))
                }),
        }
    }

    /// Publish URL, or an error when none was supplied
    pub fn output_target(&self) -> Result<&str> {
        self.output_target.as_deref().ok_or_else(|| {
            Error::InvalidRequest(format!("no outputTarget for {}", self.device_id))
        })
    }

    /// Fill the output target from configuration when the caller left it out
    pub fn with_default_output(mut self, output: &OutputConfig) -> Self {
        if self.output_target.is_none() {
            self.output_target = Some(default_output_target(output, &self.device_id, self.kind));
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_id.as_str().is_empty() {
            return Err(Error::InvalidRequest("deviceId must not be empty".to_string()));
        }
        self.source()?;
        let target = self.output_target()?;
        if !target.starts_with("rtsp://") && !target.starts_with("rtsps://") {
            return Err(Error::InvalidRequest(format!(
                "outputTarget must be an rtsp:// URL, got {}",
                target
            )));
        }
        Ok(())
    }
}

/// `rtsp://[user:pass@]host:port/<deviceId>_live|_event`
pub fn default_output_target(output: &OutputConfig, device_id: &DeviceId, kind: StreamKind) -> String {
    let auth = match (&output.username, &output.password) {
        (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
        (Some(user), None) => format!("{}@", user),
        _ => String::new(),
    };
    format!(
        "rtsp://{}{}:{}/{}{}",
        auth,
        output.host,
        output.port,
        device_id,
        kind.path_suffix()
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub device_id: DeviceId,
}

/// Inbound command envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    Start(StartRequest),
    Stop(StopRequest),
}

impl Command {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn device_id(&self) -> &DeviceId {
        match self {
            Command::Start(req) => &req.device_id,
            Command::Stop(req) => &req.device_id,
        }
    }
}

/// State vocabulary reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Activating,
    Active,
    Inactive,
    Failed,
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamStatus::Inactive | StreamStatus::Failed)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamStatus::Activating => "activating",
            StreamStatus::Active => "active",
            StreamStatus::Inactive => "inactive",
            StreamStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One state transition published for a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub device_id: DeviceId,
    pub kind: StreamKind,
    pub state: StreamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StateUpdate {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// How a session ended; the only thing that crosses the worker boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Stopped, remotely ended or source exhausted
    Completed { reason: String },
    /// Any error path
    Failed { error: String },
}

impl SessionOutcome {
    pub fn completed(reason: impl Into<String>) -> Self {
        SessionOutcome::Completed {
            reason: reason.into(),
        }
    }

    pub fn failed(error: impl fmt::Display) -> Self {
        SessionOutcome::Failed {
            error: error.to_string(),
        }
    }

    pub fn status(&self) -> StreamStatus {
        match self {
            SessionOutcome::Completed { .. } => StreamStatus::Inactive,
            SessionOutcome::Failed { .. } => StreamStatus::Failed,
        }
    }

    pub fn error(&self) -> Option<String> {
        match self {
            SessionOutcome::Completed { .. } => None,
            SessionOutcome::Failed { error } => Some(error.clone()),
        }
    }
}
