//! Event recording relays through the worker pool with a stand-in transcoder

mod harness;

use camstream_core::{
    DeviceId, PoolConfig, PortConfig, PortPool, StartRequest, StateUpdate, StreamKind,
    StreamStatus, TranscoderConfig, WorkerPool,
};
use camstream_webrtc::{StreamLauncher, WebRtcConfig};
use harness::{next_update, transcoder_script, wait_for};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

const DEVICE: &str = "cam-event";
const RECORDING: &str = "https://recordings.example.invalid/clip.mp4";

async fn pool_with_script(body: &str) -> (WorkerPool, UnboundedReceiver<StateUpdate>, TempDir) {
    harness::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let transcoder = TranscoderConfig {
        program: transcoder_script(dir.path(), body),
        stop_grace_ms: 500,
        ..Default::default()
    };
    let ports = PortPool::new(&PortConfig::default()).unwrap();
    let launcher = StreamLauncher::new(WebRtcConfig::local(), transcoder, ports).unwrap();
    let (pool, rx) = WorkerPool::start(
        &PoolConfig {
            workers: Some(1),
            stop_settle_ms: 3000,
        },
        Arc::new(launcher),
    )
    .await
    .unwrap();
    (pool, rx, dir)
}

fn event_request() -> StartRequest {
    StartRequest::event(
        DEVICE,
        RECORDING,
        &format!("rtsp://127.0.0.1:8554/{}_event", DEVICE),
    )
}

#[tokio::test]
async fn test_recording_relayed_to_the_end() {
    let (pool, mut rx, dir) = pool_with_script("echo \"$@\" > \"$(dirname \"$0\")/args\"\nsleep 1").await;

    pool.start_session(event_request()).await.unwrap();
    let first = next_update(&mut rx).await;
    assert_eq!(first.state, StreamStatus::Activating);
    assert_eq!(first.kind, StreamKind::Event);

    let active = wait_for(&mut rx, DEVICE, StreamStatus::Active).await;
    assert_eq!(active.state, StreamStatus::Active, "{:?}", active.error);
    let ended = wait_for(&mut rx, DEVICE, StreamStatus::Inactive).await;
    assert_eq!(ended.state, StreamStatus::Inactive);
    assert!(ended.error.is_none());

    let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
    assert!(args.contains(RECORDING));
    assert!(args.contains("cam-event_event"));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_recording_relay_failure_is_reported() {
    let (pool, mut rx, _dir) =
        pool_with_script("echo 'clip.mp4: Server returned 404 Not Found' >&2\nsleep 1\nexit 3").await;

    pool.start_session(event_request()).await.unwrap();
    let active = wait_for(&mut rx, DEVICE, StreamStatus::Active).await;
    assert_eq!(active.state, StreamStatus::Active, "{:?}", active.error);

    let failed = wait_for(&mut rx, DEVICE, StreamStatus::Failed).await;
    assert_eq!(failed.state, StreamStatus::Failed);
    assert!(failed.error.unwrap().contains("exited with code 3"));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_stop_ends_recording_relay() {
    let (pool, mut rx, _dir) = pool_with_script("exec sleep 30").await;

    pool.start_session(event_request()).await.unwrap();
    wait_for(&mut rx, DEVICE, StreamStatus::Active).await;

    pool.stop_session(&DeviceId::new(DEVICE)).unwrap();
    let ended = wait_for(&mut rx, DEVICE, StreamStatus::Inactive).await;
    assert_eq!(ended.state, StreamStatus::Inactive);
    assert!(ended.error.is_none());

    // device is free again
    pool.start_session(event_request()).await.unwrap();
    wait_for(&mut rx, DEVICE, StreamStatus::Active).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn test_missing_transcoder_fails_session() {
    harness::init_tracing();
    let transcoder = TranscoderConfig {
        program: "/nonexistent/transcoder".into(),
        ..Default::default()
    };
    let ports = PortPool::new(&PortConfig::default()).unwrap();
    let launcher = StreamLauncher::new(WebRtcConfig::local(), transcoder, ports).unwrap();
    let (pool, mut rx) = WorkerPool::start(
        &PoolConfig {
            workers: Some(1),
            stop_settle_ms: 3000,
        },
        Arc::new(launcher),
    )
    .await
    .unwrap();

    pool.start_session(event_request()).await.unwrap();
    let failed = wait_for(&mut rx, DEVICE, StreamStatus::Failed).await;
    assert_eq!(failed.state, StreamStatus::Failed);
    assert!(failed.error.unwrap().contains("failed to spawn"));

    pool.shutdown().await;
}

#[test]
fn test_launcher_rejects_invalid_settings() {
    let ports = PortPool::new(&PortConfig::default()).unwrap();
    let mut webrtc = WebRtcConfig::local();
    webrtc.stun_servers = vec!["http://not-stun".to_string()];
    assert!(StreamLauncher::new(webrtc, TranscoderConfig::default(), ports.clone()).is_err());

    let transcoder = TranscoderConfig {
        rtsp_transport: "http".to_string(),
        ..Default::default()
    };
    assert!(StreamLauncher::new(WebRtcConfig::local(), transcoder, ports).is_err());
}
