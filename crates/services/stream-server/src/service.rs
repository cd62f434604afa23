//! Newline-delimited JSON front end for the worker pool
//!
//! Commands are read one per line; state updates are written one per line.
//! A line that fails to parse or is refused by the pool is logged and
//! skipped, so one bad command never ends the loop.

use camstream_core::{Command, OutputConfig, StateUpdate, WorkerPool};
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What the command loop did with its input
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub accepted: usize,
    pub rejected: usize,
}

/// Apply one command line to the pool
pub async fn handle_line(
    pool: &WorkerPool,
    output: &OutputConfig,
    line: &str,
) -> camstream_core::Result<()> {
    match Command::from_json(line)? {
        Command::Start(request) => {
            let request = request.with_default_output(output);
            info!(
                device_id = %request.device_id,
                kind = %request.kind,
                "start requested"
            );
            pool.start_session(request).await
        }
        Command::Stop(request) => {
            info!(device_id = %request.device_id, "stop requested");
            pool.stop_session(&request.device_id)
        }
    }
}

/// Read commands until end of input or until `shutdown` resolves
pub async fn run_commands<R, S>(
    pool: &WorkerPool,
    output: &OutputConfig,
    input: R,
    shutdown: S,
) -> std::io::Result<LoopStats>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    let mut lines = input.lines();
    let mut stats = LoopStats::default();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested, no longer reading commands");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!("command input closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match handle_line(pool, output, line).await {
            Ok(()) => stats.accepted += 1,
            Err(e) => {
                stats.rejected += 1;
                warn!(class = ?e.class(), "command rejected: {}", e);
            }
        }
    }

    Ok(stats)
}

/// Write every state update as one JSON line until the pool closes the channel
pub async fn publish_updates<W>(
    mut updates: mpsc::UnboundedReceiver<StateUpdate>,
    mut out: W,
) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(update) = updates.recv().await {
        let json = match update.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(device_id = %update.device_id, "could not encode state update: {}", e);
                continue;
            }
        };
        out.write_all(json.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        written += 1;
    }
    Ok(written)
}
