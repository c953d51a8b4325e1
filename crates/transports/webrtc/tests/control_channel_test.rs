//! Control channel and bandwidth tests
//!
//! Ping/latency, state mirroring, message relay and bandwidth-driven
//! allocation on live (mock) connections.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use harness::{eventually, MeshHarness, INITIAL_BITRATE};
use meshcall_webrtc::media::TrackId;
use meshcall_webrtc::MirrorState;
use serde_json::Value;

// =============================================================================
// Ping / latency
// =============================================================================

#[tokio::test]
async fn test_ping_round_trip_measures_latency() {
    let mut h = MeshHarness::new();
    let (peer, session, conn) = h.connect_as_offerer(2).await;
    session.open_channel("ping");
    let ping = session.channel("ping").unwrap();
    let p = Arc::clone(&ping);
    let c = Arc::clone(&conn);
    assert!(eventually(move || c.ping_channel().is_some()).await);

    h.orchestrator.ping_round().await;
    assert_eq!(p.sent(), vec!["ping".to_string()]);

    tokio::time::sleep(Duration::from_millis(5)).await;
    session.deliver("ping", "pong");
    let c = Arc::clone(&conn);
    assert!(eventually(move || c.latency().is_some()).await);
    assert!(conn.latency().unwrap() >= Duration::from_millis(5));

    h.orchestrator.ping_round().await;
    loop {
        let event = h.next_event("latency").await;
        if let Some(ms) = event["latencies"].get(peer.to_string()) {
            assert!(ms.as_u64().unwrap() >= 5);
            break;
        }
    }
}

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let h = MeshHarness::new();
    let (_, session, _) = h.connect_as_offerer(2).await;
    session.open_channel("ping");
    let ping = session.channel("ping").unwrap();

    session.deliver("ping", "ping");
    let p = Arc::clone(&ping);
    assert!(eventually(move || p.sent().contains(&"pong".to_string())).await);
}

#[tokio::test]
async fn test_pong_without_ping_ignored() {
    let h = MeshHarness::new();
    let (_, session, conn) = h.connect_as_offerer(2).await;
    session.open_channel("ping");

    session.deliver("ping", "pong");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(conn.latency().is_none());
}

#[tokio::test]
async fn test_ping_round_skips_unopened_channels() {
    let h = MeshHarness::new();
    let (_, session, _) = h.connect_as_offerer(2).await;

    h.orchestrator.ping_round().await;
    assert!(session.channel("ping").unwrap().sent().is_empty());
}

// =============================================================================
// State mirroring and relay
// =============================================================================

#[tokio::test]
async fn test_user_state_pushed_when_data_channel_opens() {
    let h = MeshHarness::new();
    h.mirror.replace(MirrorState {
        user_name: "ana".to_string(),
        is_in_chat: true,
        ..Default::default()
    });
    let (_, session, _) = h.connect_as_offerer(2).await;

    session.open_channel("data");
    let data = session.channel("data").unwrap();
    let d = Arc::clone(&data);
    assert!(eventually(move || !d.sent().is_empty()).await);

    let message: Value = serde_json::from_str(&data.sent()[0]).unwrap();
    assert_eq!(message["type"], "userState");
    assert_eq!(message["userState"]["userName"], "ana");
    assert_eq!(message["userState"]["isInChat"], true);
}

#[tokio::test]
async fn test_answering_side_uses_remote_channels() {
    let h = MeshHarness::new();
    let peer = h.add_peer(2, harness::LOCAL_START + 500);
    let offer = meshcall_webrtc::signaling::SignalingMessage::Offer {
        from: peer,
        description: meshcall_webrtc::rtc::SessionDescription::offer("remote-offer"),
        candidates: vec![],
    };
    h.orchestrator.accept_offer(offer).await.unwrap();
    assert!(h.signaler.wait_for(1, Duration::from_secs(2)).await);

    let session = h.engine.session_for(peer).unwrap();
    let data = session.announce_remote_channel("data");
    let d = Arc::clone(&data);
    assert!(eventually(move || !d.sent().is_empty()).await);

    let conn = h.orchestrator.connection(peer).await.unwrap();
    assert!(conn.data_channel().is_some());
}

#[tokio::test]
async fn test_peer_user_state_relayed_and_sets_session_flag() {
    let mut h = MeshHarness::new();
    let (peer, session, conn) = h.connect_as_offerer(2).await;
    assert!(!conn.in_session());

    session.deliver(
        "data",
        r#"{"type":"userState","userState":{"isInChat":true,"userName":"bo"},"from":"1.2.3.4"}"#,
    );
    let event = h.next_event("userState").await;
    assert_eq!(event["from"], peer.to_string());
    assert_eq!(event["userState"]["userName"], "bo");
    assert!(conn.in_session());

    session.deliver("data", r#"{"type":"userState","userState":{"isInChat":false}}"#);
    h.next_event("userState").await;
    assert!(!conn.in_session());
}

#[tokio::test]
async fn test_direct_message_relayed_with_origin() {
    let mut h = MeshHarness::new();
    let (peer, session, _) = h.connect_as_offerer(2).await;

    session.deliver("data", r#"{"type":"dm","content":"hello"}"#);
    let event = h.next_event("dm").await;
    assert_eq!(event["content"], "hello");
    assert_eq!(event["from"], peer.to_string());
}

#[tokio::test]
async fn test_malformed_peer_message_dropped() {
    let mut h = MeshHarness::new();
    let (_, session, _) = h.connect_as_offerer(2).await;

    session.deliver("data", "not json");
    session.deliver("data", r#"{"type":"dm","content":"after"}"#);
    let event = h.next_event("dm").await;
    assert_eq!(event["content"], "after");
}

#[tokio::test]
async fn test_publish_local_state_reaches_open_channels() {
    let h = MeshHarness::new();
    let (_, first, _) = h.connect_as_offerer(2).await;
    let (_, second, _) = h.connect_as_offerer(3).await;
    first.open_channel("data");

    let data = first.channel("data").unwrap();
    let d = Arc::clone(&data);
    assert!(eventually(move || d.sent().len() == 1).await);

    let delivered = h
        .orchestrator
        .publish_local_state(MirrorState {
            is_sharing_screen: true,
            ..Default::default()
        })
        .await;
    assert_eq!(delivered, 1);
    assert!(h.mirror.get().is_sharing_screen);

    let last: Value = serde_json::from_str(data.sent().last().unwrap()).unwrap();
    assert_eq!(last["userState"]["isSharingScreen"], true);
    assert!(second.channel("data").unwrap().sent().is_empty());
}

// =============================================================================
// Bandwidth
// =============================================================================

#[tokio::test]
async fn test_bandwidth_round_reports_and_allocates() {
    let mut h = MeshHarness::new();
    let (peer, session, conn) = h.connect_as_offerer(2).await;
    h.mirror.replace(MirrorState {
        is_in_chat: true,
        ..Default::default()
    });

    h.orchestrator.bandwidth_round().await;
    let event = h.next_event("BER").await;
    assert_eq!(event["targetBitrates"][peer.to_string()], INITIAL_BITRATE);
    assert_eq!(conn.allocation()[&TrackId::Microphone], 128_000);

    session.estimator().set(50_000);
    h.orchestrator.bandwidth_round().await;
    assert_eq!(conn.allocation()[&TrackId::Microphone], 32_000);
}

#[tokio::test]
async fn test_local_state_change_reallocates_with_last_estimate() {
    let h = MeshHarness::new();
    let (_, _, conn) = h.connect_as_offerer(2).await;
    h.mirror.replace(MirrorState {
        is_in_chat: true,
        ..Default::default()
    });
    h.orchestrator.bandwidth_round().await;
    assert!(!conn.allocation().contains_key(&TrackId::ScreenVideo));

    h.orchestrator
        .publish_local_state(MirrorState {
            is_in_chat: true,
            is_sharing_screen: true,
            ..Default::default()
        })
        .await;
    let allocation = conn.allocation();
    assert_eq!(allocation[&TrackId::Microphone], 32_000);
    assert_eq!(allocation[&TrackId::ScreenVideo], 300_000);
}

#[tokio::test]
async fn test_estimator_released_on_teardown() {
    let mut h = MeshHarness::new();
    let (peer, session, _) = h.connect_as_offerer(2).await;
    session.set_state(meshcall_webrtc::rtc::LinkState::Failed);
    assert!(h.wait_removed(peer).await);

    h.orchestrator.bandwidth_round().await;
    while let Ok(event) = h.events.try_recv() {
        assert_ne!(event.name(), "BER");
    }

    h.orchestrator.status_round().await;
    let status = h.next_event("rtc_status").await;
    assert_eq!(status["totalPeers"], 0);
}

// =============================================================================
// Status
// =============================================================================

#[tokio::test]
async fn test_status_report_lists_connections() {
    let mut h = MeshHarness::new();
    let (first, _, _) = h.connect_as_offerer(3).await;
    let (second, _, _) = h.connect_as_offerer(2).await;

    h.orchestrator.status_round().await;
    let status = h.next_event("rtc_status").await;
    assert_eq!(status["totalPeers"], 2);
    let rows = status["connections"].as_array().unwrap();
    assert_eq!(rows[0]["peerIP"], second.to_string());
    assert_eq!(rows[1]["peerIP"], first.to_string());
    assert_eq!(rows[0]["role"], "offer");
    assert!(rows[0]["latency"].is_null());
}
