//! Mesh lifecycle tests
//!
//! Initiator selection, offer/answer exchange, teardown and the at-most-one
//! connection rule, driven through the in-memory harness.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use harness::{eventually, MeshHarness, LOCAL, LOCAL_RANDOM_ID, LOCAL_START};
use meshcall_webrtc::connection::Phase;
use meshcall_webrtc::identity::unix_now;
use meshcall_webrtc::rtc::{IceCandidate, LinkState, SdpKind, SessionDescription};
use meshcall_webrtc::signaling::{Role, SignalingMessage};
use meshcall_webrtc::{Error, MeshConfig};

fn remote_candidate() -> IceCandidate {
    IceCandidate {
        candidate: "candidate:9 1 udp 2130706431 100.64.0.9 40000 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

fn offer_from(peer: std::net::Ipv4Addr) -> SignalingMessage {
    SignalingMessage::Offer {
        from: peer,
        description: SessionDescription::offer("remote-offer"),
        candidates: vec![remote_candidate()],
    }
}

// =============================================================================
// Initiator selection
// =============================================================================

#[tokio::test]
async fn test_later_node_sends_offer_with_candidates() {
    let h = MeshHarness::new();
    let peer = h.add_peer(2, LOCAL_START - 500);

    let outcome = h.orchestrator.reconcile().await;
    assert_eq!(outcome.initiated, vec![peer]);
    assert!(h.signaler.wait_for(1, Duration::from_secs(2)).await);

    let (to, message) = h.signaler.sent().remove(0);
    assert_eq!(to, peer);
    let SignalingMessage::Offer {
        from,
        description,
        candidates,
    } = message
    else {
        panic!("Expected an offer");
    };
    assert_eq!(from, LOCAL);
    assert_eq!(description.kind, SdpKind::Offer);
    assert_eq!(candidates.len(), 1);

    let session = h.engine.session_for(peer).unwrap();
    assert!(session.channel("data").is_some());
    assert!(session.channel("ping").is_some());
    assert_eq!(session.local_description(), Some(description));

    let conn = h.orchestrator.connection(peer).await.unwrap();
    assert_eq!(conn.role(), Role::Offer);
    assert_eq!(conn.phase(), Phase::Negotiating);
}

#[tokio::test]
async fn test_earlier_node_waits_for_offer() {
    let h = MeshHarness::new();
    h.add_peer(2, LOCAL_START + 500);

    let outcome = h.orchestrator.reconcile().await;
    assert!(outcome.initiated.is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.engine.sessions().is_empty());
    assert!(h.signaler.sent().is_empty());
}

#[tokio::test]
async fn test_random_id_breaks_start_time_tie() {
    let h = MeshHarness::new();
    let lower = h.add_peer_with_id(2, LOCAL_START, LOCAL_RANDOM_ID - 1);
    h.add_peer_with_id(3, LOCAL_START, LOCAL_RANDOM_ID + 1);

    let outcome = h.orchestrator.reconcile().await;
    assert_eq!(outcome.initiated, vec![lower]);
}

#[tokio::test]
async fn test_identical_identity_never_initiates() {
    let h = MeshHarness::new();
    h.add_peer_with_id(2, LOCAL_START, LOCAL_RANDOM_ID);

    let outcome = h.orchestrator.reconcile().await;
    assert!(outcome.initiated.is_empty());
    assert!(h.orchestrator.connections().await.is_empty());
}

// =============================================================================
// At most one connection per peer
// =============================================================================

#[tokio::test]
async fn test_repeated_reconcile_keeps_one_connection() {
    let h = MeshHarness::new();
    let peer = h.add_peer(2, LOCAL_START - 500);

    h.orchestrator.reconcile().await;
    h.orchestrator.reconcile().await;
    assert!(h.signaler.wait_for(1, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.orchestrator.reconcile().await;

    assert_eq!(h.orchestrator.connections().await.len(), 1);
    assert_eq!(h.engine.sessions().len(), 1);
    assert_eq!(h.signaler.sent().len(), 1);
    assert!(h.orchestrator.connection(peer).await.is_some());
}

#[tokio::test]
async fn test_duplicate_offer_rejected_without_overwrite() {
    let h = MeshHarness::new();
    let (peer, session, conn) = h.connect_as_offerer(2).await;

    let result = h.orchestrator.accept_offer(offer_from(peer)).await;
    assert!(matches!(result, Err(Error::DuplicateConnection(addr)) if addr == peer));

    let current = h.orchestrator.connection(peer).await.unwrap();
    assert_eq!(current.id(), conn.id());
    assert_eq!(current.role(), Role::Offer);
    assert!(!session.is_closed());
    assert_eq!(h.engine.sessions().len(), 1);
}

// =============================================================================
// Answer path
// =============================================================================

#[tokio::test]
async fn test_offer_is_answered_with_candidates() {
    let h = MeshHarness::new();
    let peer = h.add_peer(2, LOCAL_START + 500);

    h.orchestrator.accept_offer(offer_from(peer)).await.unwrap();
    assert!(h.signaler.wait_for(1, Duration::from_secs(2)).await);

    let (to, message) = h.signaler.sent().remove(0);
    assert_eq!(to, peer);
    assert_eq!(message.role(), Role::Answer);
    assert_eq!(message.from(), LOCAL);

    let session = h.engine.session_for(peer).unwrap();
    assert_eq!(
        session.remote_description(),
        Some(SessionDescription::offer("remote-offer"))
    );
    assert_eq!(session.remote_candidates(), vec![remote_candidate()]);
    // the answerer never opens channels itself
    assert!(session.channel("data").is_none());

    let conn = h.orchestrator.connection(peer).await.unwrap();
    assert_eq!(conn.role(), Role::Answer);
}

#[tokio::test]
async fn test_answer_completes_offer() {
    let h = MeshHarness::new();
    let (peer, session, _conn) = h.connect_as_offerer(2).await;

    let answer = SignalingMessage::Answer {
        from: peer,
        description: SessionDescription::answer("remote-answer"),
        candidates: vec![remote_candidate()],
    };
    h.orchestrator.complete_answer(answer).await.unwrap();

    assert_eq!(
        session.remote_description(),
        Some(SessionDescription::answer("remote-answer"))
    );
    assert_eq!(session.remote_candidates().len(), 1);
}

#[tokio::test]
async fn test_answer_without_connection_is_not_found() {
    let h = MeshHarness::new();
    let answer = SignalingMessage::Answer {
        from: harness::peer_addr(5),
        description: SessionDescription::answer("x"),
        candidates: vec![],
    };
    let result = h.orchestrator.complete_answer(answer).await;
    assert!(matches!(result, Err(Error::ConnectionNotFound(_))));
}

#[tokio::test]
async fn test_answer_to_answering_side_tears_down() {
    let h = MeshHarness::new();
    let peer = h.add_peer(2, LOCAL_START + 500);
    h.orchestrator.accept_offer(offer_from(peer)).await.unwrap();
    assert!(h.signaler.wait_for(1, Duration::from_secs(2)).await);

    let answer = SignalingMessage::Answer {
        from: peer,
        description: SessionDescription::answer("unexpected"),
        candidates: vec![],
    };
    let result = h.orchestrator.complete_answer(answer).await;
    assert!(matches!(
        result,
        Err(Error::RoleMismatch {
            actual: Role::Answer,
            ..
        })
    ));
    assert!(h.orchestrator.connection(peer).await.is_none());
    assert!(h.engine.session_for(peer).unwrap().is_closed());
}

#[tokio::test]
async fn test_offer_from_self_rejected() {
    let h = MeshHarness::new();
    let result = h.orchestrator.accept_offer(offer_from(LOCAL)).await;
    assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    assert!(h.engine.sessions().is_empty());
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn test_departed_peer_is_torn_down() {
    let h = MeshHarness::new();
    let (peer, session, conn) = h.connect_as_offerer(2).await;

    let expired = h.directory.expire(unix_now() + 60);
    assert_eq!(expired, vec![peer]);

    let outcome = h.orchestrator.reconcile().await;
    assert_eq!(outcome.removed, vec![peer]);
    assert!(outcome.initiated.is_empty());
    assert!(h.orchestrator.connection(peer).await.is_none());
    assert!(session.is_closed());
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_restarted_peer_replaces_stale_connection() {
    let h = MeshHarness::new();
    let (peer, session, conn) = h.connect_as_offerer(2).await;

    // Same address, new process that started after this node
    h.add_peer_with_id(2, LOCAL_START + 500, 9);
    let outcome = h.orchestrator.reconcile().await;
    assert_eq!(outcome.removed, vec![peer]);
    assert!(outcome.initiated.is_empty());
    assert!(session.is_closed());
    assert!(conn.is_closed());

    h.orchestrator.accept_offer(offer_from(peer)).await.unwrap();
    let current = h.orchestrator.connection(peer).await.unwrap();
    assert_eq!(current.role(), Role::Answer);
    assert_ne!(current.id(), conn.id());

    let outcome = h.orchestrator.reconcile().await;
    assert!(outcome.removed.is_empty());
}

#[tokio::test]
async fn test_failed_signaling_abandons_and_retries() {
    let h = MeshHarness::new();
    let peer = h.add_peer(2, LOCAL_START - 500);
    h.signaler.set_fail(true);

    h.orchestrator.reconcile().await;
    let engine = Arc::clone(&h.engine);
    assert!(
        eventually(move || engine.session_for(peer).map(|s| s.is_closed()).unwrap_or(false)).await
    );
    assert!(h.orchestrator.connection(peer).await.is_none());
    let first = h.engine.session_for(peer).unwrap();

    h.signaler.set_fail(false);
    h.orchestrator.reconcile().await;
    assert!(h.signaler.wait_for(1, Duration::from_secs(2)).await);

    let second = h.engine.session_for(peer).unwrap();
    assert_ne!(first.key.id, second.key.id);
    assert!(!second.is_closed());
}

#[tokio::test]
async fn test_session_creation_failure_leaves_no_connection() {
    let h = MeshHarness::new();
    let peer = h.add_peer(2, LOCAL_START - 500);
    h.engine.set_fail_create(true);

    h.orchestrator.reconcile().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.orchestrator.connection(peer).await.is_none());
}

#[tokio::test]
async fn test_stuck_negotiation_is_retried() {
    let config = MeshConfig {
        negotiation_timeout: Duration::from_millis(30),
        ..Default::default()
    };
    let h = MeshHarness::with_config(config);
    let (peer, session, _conn) = h.connect_as_offerer(2).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    let outcome = h.orchestrator.reconcile().await;
    assert_eq!(outcome.removed, vec![peer]);
    assert_eq!(outcome.initiated, vec![peer]);
    assert!(session.is_closed());
}

// =============================================================================
// Transport state
// =============================================================================

#[tokio::test]
async fn test_connected_state_establishes_and_is_published() {
    let mut h = MeshHarness::new();
    let (peer, session, conn) = h.connect_as_offerer(2).await;

    session.set_state(LinkState::Connected);
    let event = h.next_event("connection_state").await;
    assert_eq!(event["state"], "connected");
    assert_eq!(event["peerIP"], peer.to_string());

    let c = Arc::clone(&conn);
    assert!(eventually(move || c.phase() == Phase::Established).await);
}

#[tokio::test]
async fn test_failed_transport_tears_down() {
    let h = MeshHarness::new();
    let (peer, session, conn) = h.connect_as_offerer(2).await;

    session.set_state(LinkState::Failed);
    assert!(h.wait_removed(peer).await);
    assert!(conn.is_closed());
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_events_from_superseded_session_ignored() {
    let h = MeshHarness::new();
    let (peer, old_session, _old) = h.connect_as_offerer(2).await;

    old_session.set_state(LinkState::Failed);
    assert!(h.wait_removed(peer).await);

    let (_, _new_session, conn) = h.connect_as_offerer(2).await;
    old_session.set_state(LinkState::Connected);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(conn.phase(), Phase::Negotiating);
    assert_eq!(conn.link_state(), LinkState::New);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let h = MeshHarness::new();
    let (_, first, _) = h.connect_as_offerer(2).await;
    let (_, second, _) = h.connect_as_offerer(3).await;

    h.orchestrator.shutdown().await;
    assert!(h.orchestrator.connections().await.is_empty());
    assert!(first.is_closed());
    assert!(second.is_closed());
}
