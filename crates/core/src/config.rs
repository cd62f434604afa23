//! Configuration sections owned by the session core
//!
//! Every section deserializes from TOML with per-field defaults, so a config
//! file only needs to name the values it changes.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker slots; derived from the CPU count when unset
    #[serde(default)]
    pub workers: Option<usize>,

    /// Delay after a stop request before a session is force-declared inactive
    #[serde(default = "default_stop_settle_ms")]
    pub stop_settle_ms: u64,
}

fn default_stop_settle_ms() -> u64 {
    2000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: None,
            stop_settle_ms: default_stop_settle_ms(),
        }
    }
}

impl PoolConfig {
    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }

    /// Effective number of worker slots
    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|n| *n > 0)
            .unwrap_or_else(|| crate::pool::default_pool_size(num_cpus::get()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == Some(0) {
            return Err(Error::InvalidConfig(
                "workers must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Local UDP port range handed to the transcoder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// First port of the reservable range
    #[serde(default = "default_range_start")]
    pub range_start: u16,

    /// Last port of the reservable range (inclusive)
    #[serde(default = "default_range_end")]
    pub range_end: u16,

    /// How long a reservation may wait for free ports
    #[serde(default = "default_reserve_timeout_ms")]
    pub reserve_timeout_ms: u64,
}

fn default_range_start() -> u16 {
    40000
}

fn default_range_end() -> u16 {
    40999
}

fn default_reserve_timeout_ms() -> u64 {
    5000
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            range_start: default_range_start(),
            range_end: default_range_end(),
            reserve_timeout_ms: default_reserve_timeout_ms(),
        }
    }
}

impl PortConfig {
    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_millis(self.reserve_timeout_ms)
    }

    /// Lowest even port of the range; RTP ports are always even
    pub fn first_rtp_port(&self) -> u32 {
        let start = self.range_start as u32;
        start + start % 2
    }

    /// Number of RTP/RTCP pairs (`n`, `n + 1` with `n` even) inside the range
    pub fn rtp_pairs(&self) -> usize {
        let first = self.first_rtp_port();
        let end = self.range_end as u32;
        if first + 1 > end {
            0
        } else {
            ((end - first - 1) / 2 + 1) as usize
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.range_start == 0 || self.range_start > self.range_end {
            return Err(Error::InvalidConfig(format!(
                "port range {}-{} is empty or starts at 0",
                self.range_start, self.range_end
            )));
        }
        if self.rtp_pairs() == 0 {
            return Err(Error::InvalidConfig(format!(
                "port range {}-{} holds no even/odd RTP and RTCP pair",
                self.range_start, self.range_end
            )));
        }
        Ok(())
    }
}

/// Transcoder (ffmpeg) invocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    /// Executable to launch
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Value passed to `-loglevel`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Video codec for the restream (`copy` keeps the camera bitstream)
    #[serde(default = "default_video_codec")]
    pub video_codec: String,

    /// Codec the primary audio sub-stream is re-encoded to
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    /// Publish a second, pass-through copy of the camera audio
    #[serde(default = "default_dual_audio")]
    pub dual_audio: bool,

    /// Transport used when publishing to the RTSP server
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String,

    /// Extra arguments inserted before the input
    #[serde(default)]
    pub extra_input_args: Vec<String>,

    /// Time between SIGTERM and SIGKILL when stopping the process
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_program() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_log_level() -> String {
    "error".to_string()
}

fn default_video_codec() -> String {
    "copy".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_dual_audio() -> bool {
    true
}

fn default_rtsp_transport() -> String {
    "tcp".to_string()
}

fn default_stop_grace_ms() -> u64 {
    1000
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            log_level: default_log_level(),
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            dual_audio: default_dual_audio(),
            rtsp_transport: default_rtsp_transport(),
            extra_input_args: Vec::new(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl TranscoderConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.program.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "transcoder program must not be empty".to_string(),
            ));
        }
        if self.rtsp_transport != "tcp" && self.rtsp_transport != "udp" {
            return Err(Error::InvalidConfig(format!(
                "rtsp_transport must be tcp or udp, got {}",
                self.rtsp_transport
            )));
        }
        Ok(())
    }
}

/// Local RTSP server that restreams are published to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_host")]
    pub host: String,

    #[serde(default = "default_output_port")]
    pub port: u16,

    /// Publisher credentials, if the RTSP server requires them
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_output_host() -> String {
    "127.0.0.1".to_string()
}

fn default_output_port() -> u16 {
    8554
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            host: default_output_host(),
            port: default_output_port(),
            username: None,
            password: None,
        }
    }
}
