//! Event recording relay: the transcoder pulls a stored recording and
//! republishes it; there is no signaling or peer connection.

use super::state::{PhaseTracker, SessionPhase};
use super::{describe_exit, SessionEnv};
use camstream_core::{
    DeviceId, ExitReason, SessionContext, SessionOutcome, TranscodeJob, TranscoderProcess,
};
use std::sync::Arc;
use tracing::{info, warn};

pub struct EventSession {
    env: Arc<SessionEnv>,
    device_id: DeviceId,
    recording_url: String,
    output_target: String,
    phase: PhaseTracker,
}

impl EventSession {
    pub fn new(
        env: Arc<SessionEnv>,
        device_id: DeviceId,
        recording_url: impl Into<String>,
        output_target: impl Into<String>,
    ) -> Self {
        let phase = PhaseTracker::new(device_id.as_str());
        Self {
            env,
            device_id,
            recording_url: recording_url.into(),
            output_target: output_target.into(),
            phase,
        }
    }

    /// Relay until the recording ends (exit 0 completes, anything else fails)
    /// or a stop arrives
    pub async fn run(mut self, ctx: SessionContext) -> SessionOutcome {
        let mut stop = ctx.stop_signal();
        if ctx.stop_requested() {
            self.phase.advance(SessionPhase::Ending);
            self.phase.advance(SessionPhase::Ended);
            return SessionOutcome::completed("stopped before start");
        }

        let grace = self.env.transcoder.stop_grace();
        let job = TranscodeJob::recording(
            &self.env.transcoder,
            &self.recording_url,
            &self.output_target,
            self.device_id.as_str(),
        );
        let transcoder = match TranscoderProcess::spawn(job, grace).await {
            Ok(transcoder) => transcoder,
            Err(e) => {
                self.phase.advance(SessionPhase::Failed);
                warn!(device_id = %self.device_id, "recording relay did not start: {}", e);
                return SessionOutcome::failed(e);
            }
        };

        self.phase.advance(SessionPhase::Active);
        ctx.report_active();
        info!(device_id = %self.device_id, pid = ?transcoder.pid(), "event session active");

        let exit = tokio::select! {
            _ = stop.wait() => None,
            exit = transcoder.wait() => Some(exit),
        };
        let final_exit = transcoder.stop(grace).await;

        match exit {
            None => {
                self.phase.advance(SessionPhase::Ending);
                self.phase.advance(SessionPhase::Ended);
                info!(device_id = %self.device_id, exit = %final_exit, "event session stopped");
                SessionOutcome::completed("stop requested")
            }
            Some(ExitReason::Normal) => {
                self.phase.advance(SessionPhase::Ending);
                self.phase.advance(SessionPhase::Ended);
                info!(device_id = %self.device_id, "recording relayed to the end");
                SessionOutcome::completed("recording finished")
            }
            Some(other) => {
                self.phase.advance(SessionPhase::Failed);
                let detail = describe_exit(other, transcoder.last_error_line());
                warn!(device_id = %self.device_id, "event session failed: {}", detail);
                SessionOutcome::failed(detail)
            }
        }
    }
}
