//! Streaming sessions
//!
//! A session binds one source (a live WebRTC view or a stored recording) to
//! one transcoder publishing to the output target, and runs until stopped or
//! until one of its parts ends.

mod event;
mod live;
pub mod state;

pub use event::EventSession;
pub use live::LiveSession;
pub use state::{PhaseTracker, SessionPhase};

use crate::config::WebRtcConfig;
use camstream_core::{ExitReason, PortPool, TranscoderConfig};

/// Shared settings and the process-wide port pool every session draws from
#[derive(Clone)]
pub struct SessionEnv {
    pub webrtc: WebRtcConfig,
    pub transcoder: TranscoderConfig,
    pub ports: PortPool,
}

/// Transcoder exit plus its last stderr line, for the failure report
pub(crate) fn describe_exit(exit: ExitReason, last_line: Option<String>) -> String {
    match last_line {
        Some(line) => format!("transcoder {}: {}", exit, line),
        None => format!("transcoder {}", exit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_exit() {
        assert_eq!(
            describe_exit(ExitReason::Error(1), Some("Connection refused".into())),
            "transcoder exited with code 1: Connection refused"
        );
        assert_eq!(
            describe_exit(ExitReason::Killed, None),
            "transcoder killed by signal"
        );
    }
}
