//! Configuration types for the WebRTC streaming transport

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Peer connection and session timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// STUN server URLs
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    #[serde(default)]
    pub turn_servers: Vec<TurnServerConfig>,

    /// Interval between repeated key-frame requests once video flows
    #[serde(default = "default_keyframe_interval_ms")]
    pub keyframe_interval_ms: u64,

    /// How long to wait for the remote answer after the offer is sent
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,

    /// Upper bound for closing the peer connection
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// Depth of the per-session media forwarding queue; excess packets are dropped
    #[serde(default = "default_media_queue_depth")]
    pub media_queue_depth: usize,

    /// Provider signaling settings
    #[serde(default)]
    pub signaling: SignalingConfig,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Provider signaling endpoints and client identification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Fixed endpoint used with bearer-token credentials
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,

    /// Scheme for relay URLs derived from session tickets
    #[serde(default = "default_relay_scheme")]
    pub relay_scheme: String,

    /// `api_version` query parameter for relay URLs
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Sent as `X-Client-Type` and used as the relay `client_id` prefix
    #[serde(default = "default_client_type")]
    pub client_type: String,

    /// Sent as `X-Client-Version`
    #[serde(default = "default_client_version")]
    pub client_version: String,

    /// Sent as `User-Agent`
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Application ping period on token links
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Upper bound for establishing the WebSocket connection
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_keyframe_interval_ms() -> u64 {
    4000
}

fn default_negotiation_timeout_ms() -> u64 {
    20_000
}

fn default_close_timeout_ms() -> u64 {
    3000
}

fn default_media_queue_depth() -> usize {
    512
}

fn default_token_endpoint() -> String {
    "wss://api.prod.signalling.ring.devices.a2z.com:443/ws".to_string()
}

fn default_relay_scheme() -> String {
    "wss".to_string()
}

fn default_api_version() -> String {
    "4.0".to_string()
}

fn default_client_type() -> String {
    "ring_site-3333".to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_user_agent() -> String {
    format!("camstream/{}", env!("CARGO_PKG_VERSION"))
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_open_timeout_ms() -> u64 {
    10_000
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            turn_servers: Vec::new(),
            keyframe_interval_ms: default_keyframe_interval_ms(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            media_queue_depth: default_media_queue_depth(),
            signaling: SignalingConfig::default(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            token_endpoint: default_token_endpoint(),
            relay_scheme: default_relay_scheme(),
            api_version: default_api_version(),
            client_type: default_client_type(),
            client_version: default_client_version(),
            user_agent: default_user_agent(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            open_timeout_ms: default_open_timeout_ms(),
        }
    }
}

impl WebRtcConfig {
    /// Configuration with no ICE servers, for loopback peers
    pub fn local() -> Self {
        Self {
            stun_servers: Vec::new(),
            ..Default::default()
        }
    }

    pub fn keyframe_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_interval_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "stun server must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }
        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "turn server must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if self.keyframe_interval_ms < 500 {
            return Err(Error::InvalidConfig(format!(
                "keyframe_interval_ms must be at least 500, got {}",
                self.keyframe_interval_ms
            )));
        }
        if self.negotiation_timeout_ms == 0 || self.close_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "negotiation_timeout_ms and close_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.media_queue_depth == 0 {
            return Err(Error::InvalidConfig(
                "media_queue_depth must be at least 1".to_string(),
            ));
        }

        self.signaling.validate()
    }
}

impl SignalingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.token_endpoint.starts_with("ws://") && !self.token_endpoint.starts_with("wss://")
        {
            return Err(Error::InvalidConfig(format!(
                "token_endpoint must start with ws:// or wss://, got {}",
                self.token_endpoint
            )));
        }
        if self.relay_scheme != "ws" && self.relay_scheme != "wss" {
            return Err(Error::InvalidConfig(format!(
                "relay_scheme must be ws or wss, got {}",
                self.relay_scheme
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.open_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat_interval_ms and open_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WebRtcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.keyframe_interval(), Duration::from_secs(4));
        assert_eq!(config.signaling.heartbeat_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_local_config_has_no_ice_servers() {
        let config = WebRtcConfig::local();
        assert!(config.stun_servers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_stun_url() {
        let config = WebRtcConfig {
            stun_servers: vec!["http://stun.example.com".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_relay_scheme() {
        let mut config = WebRtcConfig::default();
        config.signaling.relay_scheme = "https".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: WebRtcConfig = from_json(
            r#"{"keyframe_interval_ms": 2000, "signaling": {"heartbeat_interval_ms": 1000}}"#,
        );
        assert_eq!(config.keyframe_interval_ms, 2000);
        assert_eq!(config.signaling.heartbeat_interval_ms, 1000);
        assert_eq!(config.signaling.relay_scheme, "wss");
        assert_eq!(config.negotiation_timeout_ms, 20_000);
    }

    fn from_json(json: &str) -> WebRtcConfig {
        serde_json::from_str(json).unwrap()
    }
}
