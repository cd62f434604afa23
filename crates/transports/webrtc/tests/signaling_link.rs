//! Signaling links against an in-process provider

mod harness;

use camstream_core::{Credential, DeviceId, DeviceIdentity};
use camstream_webrtc::signaling::{self, EndReason, LinkVariant, SignalingEvent};
use camstream_webrtc::{Error, SignalingConfig};
use harness::provider::{frame, session_ticket, FakeProvider};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn identity() -> DeviceIdentity {
    DeviceIdentity {
        id: DeviceId::new("12345"),
        display_name: "Front Door".to_string(),
    }
}

fn config(provider: &FakeProvider) -> SignalingConfig {
    SignalingConfig {
        token_endpoint: provider.token_endpoint(),
        relay_scheme: "ws".to_string(),
        heartbeat_interval_ms: 50,
        open_timeout_ms: 2000,
        ..Default::default()
    }
}

async fn next_event(rx: &mut UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for signaling event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_token_link_identifies_itself_and_pings() {
    harness::init_tracing();
    let mut provider = FakeProvider::start().await;
    let config = config(&provider);

    let (link, mut events) = signaling::open(
        &config,
        &Credential::BearerToken("account-token".into()),
        &identity(),
    )
    .await
    .unwrap();
    assert_eq!(link.variant(), LinkVariant::Token);

    let mut conn = provider.accept().await;
    assert_eq!(conn.uri, "/ws");
    assert_eq!(
        conn.header("authorization").as_deref(),
        Some("Bearer account-token")
    );
    assert_eq!(conn.header("x-client-type"), Some(config.client_type.clone()));
    assert_eq!(conn.header("user-agent"), Some(config.user_agent.clone()));

    link.send_offer("v=0\r\n").await.unwrap();
    let offer = conn.expect("live_view").await;
    assert_eq!(offer["body"]["doorbot_id"], json!(12345));
    assert_eq!(offer["body"]["sdp"], "v=0\r\n");

    conn.expect("ping").await;
    conn.send(frame(
        "session_created",
        json!({ "doorbot_id": 12345, "session_id": "sess-1" }),
    ));
    assert_eq!(
        next_event(&mut events).await,
        SignalingEvent::SessionCreated("sess-1".into())
    );
    assert_eq!(link.session_id().as_deref(), Some("sess-1"));
    conn.expect_where("ping", |f| f["body"]["session_id"] == "sess-1")
        .await;

    link.close().await.unwrap();
    conn.expect("close").await;
    assert_eq!(
        next_event(&mut events).await,
        SignalingEvent::Ended(EndReason::Local)
    );
    assert!(link.is_closed());
    link.close().await.unwrap();
    assert!(link.send_offer("v=0\r\n").await.is_err());
}

#[tokio::test]
async fn test_token_link_heartbeat_timeout() {
    harness::init_tracing();
    let mut provider = FakeProvider::start().await;
    let (link, mut events) = signaling::open(
        &config(&provider),
        &Credential::BearerToken("account-token".into()),
        &identity(),
    )
    .await
    .unwrap();
    let conn = provider.accept().await;

    conn.send(frame(
        "close",
        json!({ "reason": { "code": 1, "text": "Timeout waiting for ping" } }),
    ));
    assert_eq!(
        next_event(&mut events).await,
        SignalingEvent::Ended(EndReason::HeartbeatTimeout)
    );
    assert!(link.is_closed());
    assert!(matches!(
        link.activate().await,
        Err(Error::LinkClosed(_))
    ));
}

#[tokio::test]
async fn test_relay_link_follows_ticket_route() {
    harness::init_tracing();
    let mut provider = FakeProvider::start().await;
    let config = config(&provider);
    let ticket = provider.session_ticket();

    let (link, mut events) = signaling::open(
        &config,
        &Credential::SessionTicket(ticket.clone()),
        &identity(),
    )
    .await
    .unwrap();
    assert_eq!(link.variant(), LinkVariant::Relay);

    let mut conn = provider.accept().await;
    assert!(conn.uri.contains("auth_type=session_ticket"));
    assert!(conn.uri.contains("api_version=4.0"));
    assert!(conn
        .uri
        .contains(&format!("client_id={}-", config.client_type)));
    assert!(conn.header("authorization").is_none());

    link.send_offer("v=0\r\n").await.unwrap();
    conn.expect("live_view").await;

    // a message for another camera on the same relay is not ours
    conn.send(frame(
        "sdp",
        json!({ "doorbot_id": 999, "sdp": "v=other", "type": "answer" }),
    ));
    conn.send(frame(
        "sdp",
        json!({ "doorbot_id": 12345, "sdp": "v=mine", "type": "answer" }),
    ));
    conn.send(frame(
        "ice",
        json!({ "doorbot_id": 12345, "ice": "candidate:1 1 udp 1 127.0.0.1 5000 typ host", "mlineindex": 1 }),
    ));
    conn.send(frame("notification", json!({ "text": "camera_connected" })));

    assert_eq!(
        next_event(&mut events).await,
        SignalingEvent::Answer("v=mine".into())
    );
    match next_event(&mut events).await {
        SignalingEvent::IceCandidate(c) => assert_eq!(c.sdp_mline_index, 1),
        other => panic!("expected candidate, got {:?}", other),
    }
    assert_eq!(next_event(&mut events).await, SignalingEvent::CameraConnected);

    link.activate().await.unwrap();
    conn.expect("activate_session").await;
    let options = conn.expect("stream_options").await;
    assert_eq!(options["body"]["video_enabled"], true);

    conn.hang_up();
    match next_event(&mut events).await {
        SignalingEvent::Ended(EndReason::ConnectionLost(_)) => {}
        other => panic!("expected connection lost, got {:?}", other),
    }
    assert!(link.is_closed());
}

#[tokio::test]
async fn test_relay_link_rejects_bad_ticket() {
    let provider = FakeProvider::start().await;
    let result = signaling::open(
        &config(&provider),
        &Credential::SessionTicket("not-a-ticket".into()),
        &identity(),
    )
    .await;
    assert!(matches!(result, Err(Error::InvalidCredential(_))));

    let result = signaling::open(
        &config(&provider),
        &Credential::SessionTicket(session_ticket(&json!({ "region": "us" }))),
        &identity(),
    )
    .await;
    assert!(matches!(result, Err(Error::InvalidCredential(_))));
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_to_open() {
    let config = SignalingConfig {
        token_endpoint: "ws://127.0.0.1:1/ws".to_string(),
        open_timeout_ms: 1000,
        ..Default::default()
    };
    let result = signaling::open(
        &config,
        &Credential::BearerToken("account-token".into()),
        &identity(),
    )
    .await;
    assert!(matches!(
        result,
        Err(Error::WebSocketError(_)) | Err(Error::OperationTimeout(_))
    ));
}
