//! Supervision of the external transcoder process
//!
//! Each session owns at most one transcoder. The process is started in its
//! own process group, fed its input description on stdin, and watched by a
//! supervisor task that reports the exit reason exactly once.

use crate::config::TranscoderConfig;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Why the transcoder exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Clean exit
    Normal,
    /// Exit with error code
    Error(i32),
    /// Terminated by signal
    Killed,
}

impl ExitReason {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitReason::Normal)
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Normal => f.write_str("exited normally"),
            ExitReason::Error(code) => write!(f, "exited with code {}", code),
            ExitReason::Killed => f.write_str("killed by signal"),
        }
    }
}

/// Everything needed to launch one transcoder
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Written to stdin, after which stdin is closed
    pub stdin: Option<String>,
    /// Tag used in log lines (usually the device id)
    pub label: String,
}

impl TranscodeJob {
    /// Job that reads the session description on stdin and publishes to `output_target`
    pub fn live(config: &TranscoderConfig, input_sdp: String, output_target: &str, label: &str) -> Self {
        let mut args = common_prefix(config);
        args.extend(["-protocol_whitelist", "pipe,udp,rtp,file,crypto"].map(String::from));
        args.extend(config.extra_input_args.iter().cloned());
        args.extend(["-f", "sdp", "-i", "pipe:0"].map(String::from));
        args.extend(["-map", "0:v:0", "-c:v"].map(String::from));
        args.push(config.video_codec.clone());
        push_audio_maps(&mut args, config, "0:a:0");
        push_output(&mut args, config, output_target);

        Self {
            program: config.program.clone(),
            args,
            stdin: Some(input_sdp),
            label: label.to_string(),
        }
    }

    /// Job that relays a stored recording at its native rate
    pub fn recording(config: &TranscoderConfig, recording_url: &str, output_target: &str, label: &str) -> Self {
        let mut args = common_prefix(config);
        args.extend(config.extra_input_args.iter().cloned());
        args.extend(["-re", "-i"].map(String::from));
        args.push(recording_url.to_string());
        args.extend(["-map", "0:v:0", "-c:v"].map(String::from));
        args.push(config.video_codec.clone());
        // recordings may lack audio
        push_audio_maps(&mut args, config, "0:a:0?");
        push_output(&mut args, config, output_target);

        Self {
            program: config.program.clone(),
            args,
            stdin: None,
            label: label.to_string(),
        }
    }
}

fn common_prefix(config: &TranscoderConfig) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        config.log_level.clone(),
    ]
}

fn push_audio_maps(args: &mut Vec<String>, config: &TranscoderConfig, input: &str) {
    args.extend(["-map".to_string(), input.to_string(), "-c:a:0".to_string()]);
    args.push(config.audio_codec.clone());
    if config.dual_audio {
        args.extend(
            ["-map", input, "-c:a:1", "copy"]
                .iter()
                .map(|s| s.to_string()),
        );
    }
}

fn push_output(args: &mut Vec<String>, config: &TranscoderConfig, output_target: &str) {
    args.extend(["-flags", "+global_header", "-f", "rtsp", "-rtsp_transport"].map(String::from));
    args.push(config.rtsp_transport.clone());
    args.push(output_target.to_string());
}

/// Handle to a running transcoder
pub struct TranscoderProcess {
    pid: Option<u32>,
    label: String,
    exit_rx: watch::Receiver<Option<ExitReason>>,
    stop_tx: mpsc::Sender<Duration>,
    last_stderr: Arc<Mutex<Option<String>>>,
    default_grace: Duration,
}

impl TranscoderProcess {
    /// Spawn the job and start supervising it
    pub async fn spawn(job: TranscodeJob, default_grace: Duration) -> Result<Self> {
        info!(
            device_id = %job.label,
            program = %job.program.display(),
            "spawning transcoder"
        );
        debug!(args = ?job.args, "transcoder arguments");

        let mut command = Command::new(&job.program);
        command
            .args(&job.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Keep terminal signals away from the child; shutdown is ours to drive
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            Error::TranscoderError(format!(
                "failed to spawn {}: {}",
                job.program.display(),
                e
            ))
        })?;
        let pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(input) = job.stdin.as_deref() {
                // A child that exits before reading is reported through its exit status
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    warn!(device_id = %job.label, "failed to write transcoder input: {}", e);
                }
                let _ = stdin.shutdown().await;
            }
            drop(stdin);
        }

        let last_stderr = Arc::new(Mutex::new(None));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr, pid, job.label.clone(), Arc::clone(&last_stderr)));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        tokio::spawn(supervise(child, pid, job.label.clone(), stop_rx, exit_tx));

        Ok(Self {
            pid,
            label: job.label,
            exit_rx,
            stop_tx,
            last_stderr,
            default_grace,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit reason, if the process has already exited
    pub fn exit_reason(&self) -> Option<ExitReason> {
        *self.exit_rx.borrow()
    }

    /// Last line the process wrote to stderr
    pub fn last_error_line(&self) -> Option<String> {
        self.last_stderr.lock().clone()
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&self) -> ExitReason {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // supervisor gone without reporting
                return (*rx.borrow()).unwrap_or(ExitReason::Killed);
            }
        }
    }

    /// SIGTERM, wait up to `grace`, then kill. Safe to call repeatedly.
    pub async fn stop(&self, grace: Duration) -> ExitReason {
        if let Some(reason) = self.exit_reason() {
            return reason;
        }
        debug!(device_id = %self.label, pid = ?self.pid, "stopping transcoder");
        // a full channel means a stop is already underway
        let _ = self.stop_tx.try_send(grace);
        self.wait().await
    }

    pub async fn stop_default(&self) -> ExitReason {
        self.stop(self.default_grace).await
    }
}

impl Drop for TranscoderProcess {
    fn drop(&mut self) {
        if self.exit_reason().is_none() {
            let _ = self.stop_tx.try_send(self.default_grace);
        }
    }
}

async fn log_stderr(
    stderr: ChildStderr,
    pid: Option<u32>,
    label: String,
    last: Arc<Mutex<Option<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        warn!(device_id = %label, pid = ?pid, "[transcoder] {}", line);
        *last.lock() = Some(line);
    }
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    label: String,
    mut stop_rx: mpsc::Receiver<Duration>,
    exit_tx: watch::Sender<Option<ExitReason>>,
) {
    let reason = tokio::select! {
        status = child.wait() => classify(status),
        Some(grace) = stop_rx.recv() => terminate(&mut child, pid, grace).await,
    };
    info!(device_id = %label, pid = ?pid, "transcoder {}", reason);
    exit_tx.send_replace(Some(reason));
}

async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> ExitReason {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = pid {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => classify(status),
        Err(_) => {
            warn!(pid = ?pid, "transcoder did not exit within {:?}, killing", grace);
            let _ = child.kill().await;
            ExitReason::Killed
        }
    }
}

fn classify(status: std::io::Result<ExitStatus>) -> ExitReason {
    match status {
        Ok(status) if status.success() => ExitReason::Normal,
        Ok(status) => match status.code() {
            Some(code) => ExitReason::Error(code),
            None => ExitReason::Killed,
        },
        Err(e) => {
            warn!("failed to wait for transcoder: {}", e);
            ExitReason::Killed
        }
    }
}
