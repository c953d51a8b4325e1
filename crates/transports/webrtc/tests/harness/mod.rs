//! In-memory mesh harness
//!
//! Builds one orchestrator on top of the mock engine and the recording
//! signaler. Only the transport event loop runs in the background; tests
//! drive reconciliation, ping, bandwidth and status rounds explicitly.

#![allow(dead_code)]

pub mod media;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use meshcall_webrtc::bandwidth::EstimatorPool;
use meshcall_webrtc::connection::Connection;
use meshcall_webrtc::identity::{unix_now, NodeIdentity};
use meshcall_webrtc::rtc::mock::{MockEngine, MockSession, RecordingSignaler};
use meshcall_webrtc::{
    EventSender, MeshConfig, MeshContext, MeshEvent, MeshOrchestrator, PeerDirectory,
    SharedMirror,
};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

pub const LOCAL: Ipv4Addr = Ipv4Addr::new(100, 64, 0, 1);

/// Start time of the harness node; peers started earlier are offered to
pub const LOCAL_START: i64 = 2_000;

pub const LOCAL_RANDOM_ID: u64 = 7;

pub const INITIAL_BITRATE: u64 = 600_000;

const WAIT: Duration = Duration::from_secs(2);

/// Initialize tracing for tests
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug,webrtc=warn")
        .with_test_writer()
        .try_init();
}

pub fn peer_addr(last_octet: u8) -> Ipv4Addr {
    Ipv4Addr::new(100, 64, 0, last_octet)
}

pub struct MeshHarness {
    pub orchestrator: Arc<MeshOrchestrator>,
    pub directory: Arc<PeerDirectory>,
    pub mirror: Arc<SharedMirror>,
    pub engine: Arc<MockEngine>,
    pub signaler: Arc<RecordingSignaler>,
    pub events: mpsc::Receiver<MeshEvent>,
    pub media: mpsc::Receiver<Bytes>,
    shutdown: watch::Sender<bool>,
}

impl MeshHarness {
    pub fn new() -> Self {
        Self::with_config(MeshConfig::default())
    }

    pub fn with_config(config: MeshConfig) -> Self {
        init_test_tracing();

        let local = NodeIdentity {
            hostname: "local".to_string(),
            start_time: LOCAL_START,
            random_id: LOCAL_RANDOM_ID,
            virtual_address: LOCAL,
        };
        let directory = Arc::new(PeerDirectory::new(local, config.peer_timeout));
        let mirror = Arc::new(SharedMirror::new());
        let estimators = Arc::new(EstimatorPool::new());
        let engine = MockEngine::with_estimators(Arc::clone(&estimators), INITIAL_BITRATE);
        let signaler = RecordingSignaler::new();
        let (events_tx, events) = EventSender::channel(256);
        let (media_out, media) = mpsc::channel(64);

        let context = MeshContext {
            config,
            directory: Arc::clone(&directory),
            mirror: Arc::clone(&mirror),
            estimators,
            events: events_tx,
            media_out,
        };
        let orchestrator = MeshOrchestrator::new(context, engine.clone(), signaler.clone());

        let (shutdown, shutdown_rx) = watch::channel(false);
        orchestrator.spawn_event_loop(shutdown_rx);

        Self {
            orchestrator,
            directory,
            mirror,
            engine,
            signaler,
            events,
            media,
            shutdown,
        }
    }

    /// Record a presence from a peer with the given start time
    pub fn add_peer(&self, last_octet: u8, start_time: i64) -> Ipv4Addr {
        self.add_peer_with_id(last_octet, start_time, 1)
    }

    pub fn add_peer_with_id(&self, last_octet: u8, start_time: i64, random_id: u64) -> Ipv4Addr {
        let addr = peer_addr(last_octet);
        self.directory.upsert(
            NodeIdentity {
                hostname: format!("peer-{}", last_octet),
                start_time,
                random_id,
                virtual_address: addr,
            },
            unix_now(),
        );
        addr
    }

    /// Add an earlier-started peer, reconcile, and wait for the offer to go out
    pub async fn connect_as_offerer(&self, last_octet: u8) -> (Ipv4Addr, Arc<MockSession>, Arc<Connection>) {
        let peer = self.add_peer(last_octet, LOCAL_START - 1_000);
        let already_sent = self.signaler.sent().len();
        self.orchestrator.reconcile().await;
        assert!(
            self.signaler.wait_for(already_sent + 1, WAIT).await,
            "offer to {} was not sent",
            peer
        );
        let session = self.engine.session_for(peer).expect("session created");
        let conn = self.orchestrator.connection(peer).await.expect("connection registered");
        (peer, session, conn)
    }

    /// Offer-side connection that is transport-connected and whose peer has
    /// joined the shared session
    pub async fn connect_in_session(&mut self, last_octet: u8) -> (Ipv4Addr, Arc<MockSession>, Arc<Connection>) {
        let (peer, session, conn) = self.connect_as_offerer(last_octet).await;
        session.set_state(meshcall_webrtc::rtc::LinkState::Connected);
        session.open_channel("data");
        session.open_channel("ping");
        session.deliver("data", r#"{"type":"userState","userState":{"isInChat":true}}"#);
        let c = Arc::clone(&conn);
        assert!(eventually(move || c.in_session()).await, "peer never joined the session");
        (peer, session, conn)
    }

    /// Next event with the given name; other events are skipped
    pub async fn next_event(&mut self, name: &str) -> Value {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("no '{}' event within {:?}", name, WAIT))
                .expect("event channel open");
            if event.name() == name {
                return serde_json::to_value(&event).unwrap();
            }
        }
    }

    /// Wait until the orchestrator no longer tracks `peer`
    pub async fn wait_removed(&self, peer: Ipv4Addr) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.orchestrator.connection(peer).await.is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

impl Drop for MeshHarness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Poll `condition` until it holds or the wait expires
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
