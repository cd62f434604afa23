//! Shared test infrastructure: an in-process signaling provider, a
//! camera-side WebRTC peer and stand-in transcoder programs
#![allow(dead_code)]

pub mod camera;
pub mod provider;

use camstream_core::{StateUpdate, StreamStatus};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Write an executable shell script standing in for the transcoder
pub fn transcoder_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("transcoder.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub async fn next_update(rx: &mut UnboundedReceiver<StateUpdate>) -> StateUpdate {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for state update")
        .expect("state channel closed")
}

/// Skip updates until `device` reports a terminal state or `state`
pub async fn wait_for(
    rx: &mut UnboundedReceiver<StateUpdate>,
    device: &str,
    state: StreamStatus,
) -> StateUpdate {
    loop {
        let update = next_update(rx).await;
        if update.device_id.as_str() != device {
            continue;
        }
        if update.state == state || update.state.is_terminal() {
            return update;
        }
    }
}

/// Poll `done` until it holds, for at most five seconds
pub async fn eventually(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    done()
}
