//! Service configuration
//!
//! Loaded from a TOML file when one is given and present, then overridden by
//! `CAMSTREAM_*` environment variables. Command-line flags are applied last
//! by the binary.

use camstream_core::{OutputConfig, PoolConfig, PortConfig, TranscoderConfig};
use camstream_webrtc::WebRtcConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Worker slots and stop settling
    #[serde(default)]
    pub pool: PoolConfig,

    /// Local UDP ports handed to transcoders
    #[serde(default)]
    pub ports: PortConfig,

    /// Transcoder invocation
    #[serde(default)]
    pub transcoder: TranscoderConfig,

    /// RTSP server restreams are published to
    #[serde(default)]
    pub output: OutputConfig,

    /// Peer connection and provider signaling
    #[serde(default)]
    pub webrtc: WebRtcConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Defaults overridden by the process environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// File (when present) then environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.as_ref().exists() => Self::from_file(p)?,
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `CAMSTREAM_*` overrides; values that do not parse are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Pool
        if let Some(n) = lookup("CAMSTREAM_WORKERS").and_then(|v| v.parse().ok()) {
            self.pool.workers = Some(n);
        }
        if let Some(ms) = lookup("CAMSTREAM_STOP_SETTLE_MS").and_then(|v| v.parse().ok()) {
            self.pool.stop_settle_ms = ms;
        }

        // Ports
        if let Some(p) = lookup("CAMSTREAM_PORT_RANGE_START").and_then(|v| v.parse().ok()) {
            self.ports.range_start = p;
        }
        if let Some(p) = lookup("CAMSTREAM_PORT_RANGE_END").and_then(|v| v.parse().ok()) {
            self.ports.range_end = p;
        }

        // Transcoder
        if let Some(program) = lookup("CAMSTREAM_FFMPEG") {
            self.transcoder.program = PathBuf::from(program);
        }
        if let Some(codec) = lookup("CAMSTREAM_AUDIO_CODEC") {
            self.transcoder.audio_codec = codec;
        }
        if let Some(dual) = lookup("CAMSTREAM_DUAL_AUDIO").and_then(|v| v.parse().ok()) {
            self.transcoder.dual_audio = dual;
        }

        // Output
        if let Some(host) = lookup("CAMSTREAM_RTSP_HOST") {
            self.output.host = host;
        }
        if let Some(port) = lookup("CAMSTREAM_RTSP_PORT").and_then(|v| v.parse().ok()) {
            self.output.port = port;
        }
        if let Some(user) = lookup("CAMSTREAM_RTSP_USERNAME") {
            self.output.username = Some(user);
        }
        if let Some(pass) = lookup("CAMSTREAM_RTSP_PASSWORD") {
            self.output.password = Some(pass);
        }

        // WebRTC
        if let Some(servers) = lookup("CAMSTREAM_STUN_SERVERS") {
            self.webrtc.stun_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(endpoint) = lookup("CAMSTREAM_TOKEN_ENDPOINT") {
            self.webrtc.signaling.token_endpoint = endpoint;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |e: &dyn std::fmt::Display| ConfigError::Invalid(e.to_string());
        self.pool.validate().map_err(|e| invalid(&e))?;
        self.ports.validate().map_err(|e| invalid(&e))?;
        self.transcoder.validate().map_err(|e| invalid(&e))?;
        self.webrtc.validate().map_err(|e| invalid(&e))?;
        if self.output.host.is_empty() {
            return Err(ConfigError::Invalid("output host must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
