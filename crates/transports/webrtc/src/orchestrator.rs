//! Mesh connection orchestrator
//!
//! Keeps exactly one connection per online peer. A reconciliation pass diffs
//! the directory snapshot against the connection table: departed peers are
//! torn down, and new peers get a connection if the identity tie-break says
//! this node initiates. The other side learns of the connection through the
//! offer it receives on `/offer_ice`.
//!
//! Every transport callback arrives on one ordered queue drained by a single
//! event loop; events tagged with a superseded connection id are dropped.
//!
//! Lock order: connection table, then estimator pool, then per-connection
//! state. The table lock is held only for lookups, inserts and removals.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bandwidth::EstimatorPool;
use crate::config::MeshConfig;
use crate::connection::{Connection, Phase};
use crate::control::{
    parse_peer_message, peer_in_chat, user_state_message, PongOutcome, PING, PONG, USER_STATE,
};
use crate::directory::PeerDirectory;
use crate::events::{EventSender, MeshEvent, RelayedMessage, StatusEvent, StatusReport};
use crate::identity::{unix_now, Initiation, NodeIdentity};
use crate::media::spawn_track_reader;
use crate::mirror::{MirrorState, SharedMirror};
use crate::rtc::{
    ControlChannel, IceCandidate, LinkState, RtcEngine, SessionDescription, SessionKey,
    TransportEvent, TransportEventReceiver, TransportEventSender, DATA_CHANNEL_LABEL,
    PING_CHANNEL_LABEL,
};
use crate::signaling::{Role, SignalingMessage, SignalingSender};
use crate::{Error, Result};

/// Shared state the orchestrator is built around
pub struct MeshContext {
    pub config: MeshConfig,
    pub directory: Arc<PeerDirectory>,
    pub mirror: Arc<SharedMirror>,
    pub estimators: Arc<EstimatorPool>,
    pub events: EventSender,
    /// Framed inbound media for the local application
    pub media_out: mpsc::Sender<Bytes>,
}

/// What one reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Peers this node started an offer toward
    pub initiated: Vec<Ipv4Addr>,
    /// Peers whose connection was removed
    pub removed: Vec<Ipv4Addr>,
}

/// Peers already reported once, so a persistent condition is logged at
/// `warn` on first sight and at `debug` afterwards
#[derive(Default)]
struct ReportedPeers {
    peers: parking_lot::Mutex<HashSet<Ipv4Addr>>,
}

impl ReportedPeers {
    /// `true` the first time `peer` is seen since it was last forgotten
    fn first_sighting(&self, peer: Ipv4Addr) -> bool {
        self.peers.lock().insert(peer)
    }

    /// Forget peers that `keep` rejects
    fn retain(&self, keep: impl Fn(&Ipv4Addr) -> bool) {
        self.peers.lock().retain(|peer| keep(peer));
    }
}

/// Forms and maintains the full mesh
pub struct MeshOrchestrator {
    config: MeshConfig,
    directory: Arc<PeerDirectory>,
    mirror: Arc<SharedMirror>,
    estimators: Arc<EstimatorPool>,
    events: EventSender,
    media_out: mpsc::Sender<Bytes>,
    engine: Arc<dyn RtcEngine>,
    signaler: Arc<dyn SignalingSender>,
    connections: RwLock<HashMap<Ipv4Addr, Arc<Connection>>>,
    transport_tx: TransportEventSender,
    transport_rx: parking_lot::Mutex<Option<TransportEventReceiver>>,
    next_id: AtomicU64,
    identity_ties: ReportedPeers,
}

impl MeshOrchestrator {
    pub fn new(
        context: MeshContext,
        engine: Arc<dyn RtcEngine>,
        signaler: Arc<dyn SignalingSender>,
    ) -> Arc<Self> {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config: context.config,
            directory: context.directory,
            mirror: context.mirror,
            estimators: context.estimators,
            events: context.events,
            media_out: context.media_out,
            engine,
            signaler,
            connections: RwLock::new(HashMap::new()),
            transport_tx,
            transport_rx: parking_lot::Mutex::new(Some(transport_rx)),
            next_id: AtomicU64::new(1),
            identity_ties: ReportedPeers::default(),
        })
    }

    /// This node's identity
    pub fn local(&self) -> &NodeIdentity {
        self.directory.local()
    }

    pub fn mirror(&self) -> &Arc<SharedMirror> {
        &self.mirror
    }

    /// Live connection to `peer`
    pub async fn connection(&self, peer: Ipv4Addr) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&peer).cloned()
    }

    /// Snapshot of the connection table
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Spawn the event loop and every periodic loop
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.extend(self.spawn_event_loop(shutdown.clone()));

        let this = Arc::clone(self);
        handles.push(tokio::spawn(every(
            self.config.broadcast_interval,
            shutdown.clone(),
            move || {
                let this = Arc::clone(&this);
                async move {
                    this.reconcile().await;
                }
            },
        )));

        let this = Arc::clone(self);
        handles.push(tokio::spawn(every(
            self.config.ping_interval,
            shutdown.clone(),
            move || {
                let this = Arc::clone(&this);
                async move { this.ping_round().await }
            },
        )));

        let this = Arc::clone(self);
        handles.push(tokio::spawn(every(
            self.config.bandwidth_interval,
            shutdown.clone(),
            move || {
                let this = Arc::clone(&this);
                async move { this.bandwidth_round().await }
            },
        )));

        let this = Arc::clone(self);
        handles.push(tokio::spawn(every(
            self.config.status_interval,
            shutdown.clone(),
            move || {
                let this = Arc::clone(&this);
                async move { this.status_round().await }
            },
        )));

        let this = Arc::clone(self);
        handles.push(tokio::spawn(every(
            self.config.state_sync_interval,
            shutdown,
            move || {
                let this = Arc::clone(&this);
                async move {
                    this.broadcast_user_state().await;
                }
            },
        )));

        handles
    }

    // ------------------------------------------------------------------
    // Reconciliation and lifecycle
    // ------------------------------------------------------------------

    /// Diff the directory against the connection table
    pub async fn reconcile(self: &Arc<Self>) -> ReconcileOutcome {
        let snapshot = self.directory.snapshot();
        let local = self.local().clone();
        let mut outcome = ReconcileOutcome::default();

        let removed = {
            let mut table = self.connections.write().await;

            let stale: Vec<(Ipv4Addr, &'static str)> = table
                .iter()
                .filter_map(|(addr, conn)| {
                    let Some(record) = snapshot.get(addr) else {
                        return Some((*addr, "peer left the directory"));
                    };
                    if !conn.bind_identity(&record.node_info) {
                        Some((*addr, "peer restarted"))
                    } else if conn.phase() == Phase::Negotiating
                        && conn.age() > self.config.negotiation_timeout
                    {
                        Some((*addr, "negotiation timed out"))
                    } else {
                        None
                    }
                })
                .collect();

            let removed: Vec<(Arc<Connection>, &'static str)> = stale
                .into_iter()
                .filter_map(|(addr, reason)| table.remove(&addr).map(|conn| (conn, reason)))
                .collect();
            for (conn, _) in &removed {
                self.estimators.release(conn.peer());
            }

            for (addr, record) in &snapshot {
                if *addr == local.virtual_address || table.contains_key(addr) {
                    continue;
                }
                match local.initiation_toward(&record.node_info) {
                    Initiation::Initiate => outcome.initiated.push(*addr),
                    Initiation::Await => {}
                    Initiation::Unresolved if self.identity_ties.first_sighting(*addr) => {
                        warn!(
                            peer = %addr,
                            start_time = local.start_time,
                            random_id = local.random_id,
                            "Identity tie with peer; neither side will initiate"
                        )
                    }
                    Initiation::Unresolved => {
                        debug!(peer = %addr, "Identity tie persists, still not initiating")
                    }
                }
            }
            self.identity_ties.retain(|addr| {
                snapshot.get(addr).is_some_and(|record| {
                    local.initiation_toward(&record.node_info) == Initiation::Unresolved
                })
            });
            removed
        };

        for (conn, reason) in removed {
            outcome.removed.push(conn.peer());
            self.close_connection(&conn, reason).await;
        }

        for peer in &outcome.initiated {
            let this = Arc::clone(self);
            let peer = *peer;
            tokio::spawn(async move { this.initiate(peer).await });
        }

        outcome
    }

    /// Create a session and register its connection, failing if `peer`
    /// already has one
    async fn open_connection(&self, peer: Ipv4Addr, role: Role) -> Result<Arc<Connection>> {
        let mut table = self.connections.write().await;
        if table.contains_key(&peer) {
            return Err(Error::DuplicateConnection(peer));
        }

        let key = SessionKey {
            peer,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let session = self
            .engine
            .create_session(key, self.transport_tx.clone())
            .await?;
        let conn = Arc::new(Connection::new(key, role, session));
        if let Some(record) = self.directory.get(&peer) {
            conn.bind_identity(&record.node_info);
        }
        table.insert(peer, Arc::clone(&conn));

        // Still under the table lock so sessions and estimators pair up in order
        if !self.estimators.assign(peer) {
            debug!(%peer, "No pending bandwidth estimator for new connection");
        }

        info!(%peer, id = key.id, %role, "Created connection");
        Ok(conn)
    }

    /// Remove `conn` from the table if it is still the live connection for
    /// its peer, then close it
    pub async fn teardown(&self, conn: &Arc<Connection>, reason: &str) {
        {
            let mut table = self.connections.write().await;
            if let Some(current) = table.get(&conn.peer()) {
                if current.id() == conn.id() {
                    table.remove(&conn.peer());
                    self.estimators.release(conn.peer());
                }
            }
        }
        self.close_connection(conn, reason).await;
    }

    async fn close_connection(&self, conn: &Arc<Connection>, reason: &str) {
        if !conn.mark_closed() {
            return;
        }
        info!(peer = %conn.peer(), id = conn.id(), "Closing connection: {}", reason);
        if let Err(e) = conn.session().close().await {
            debug!(peer = %conn.peer(), "Error closing session: {}", e);
        }
    }

    /// Close every connection
    pub async fn shutdown(&self) {
        let all: Vec<Arc<Connection>> = {
            let mut table = self.connections.write().await;
            let all: Vec<_> = table.drain().map(|(_, c)| c).collect();
            for conn in &all {
                self.estimators.release(conn.peer());
            }
            all
        };
        join_all(all.iter().map(|conn| self.close_connection(conn, "shutting down"))).await;
    }

    // ------------------------------------------------------------------
    // Offer / answer
    // ------------------------------------------------------------------

    async fn initiate(self: Arc<Self>, peer: Ipv4Addr) {
        let conn = match self.open_connection(peer, Role::Offer).await {
            Ok(conn) => conn,
            Err(Error::DuplicateConnection(_)) => {
                debug!(%peer, "Connection already exists, not initiating");
                return;
            }
            Err(e) => {
                warn!(%peer, "Failed to create session: {}", e);
                return;
            }
        };

        if let Err(e) = self.negotiate_offer(&conn).await {
            warn!(%peer, "Offer failed: {}", e);
            self.teardown(&conn, "offer failed").await;
        }
    }

    async fn negotiate_offer(&self, conn: &Arc<Connection>) -> Result<()> {
        let session = Arc::clone(conn.session());

        let data = session.create_data_channel(DATA_CHANNEL_LABEL).await?;
        conn.attach_channel(data);
        let ping = session.create_data_channel(PING_CHANNEL_LABEL).await?;
        conn.attach_channel(ping);

        conn.set_senders(session.add_local_tracks().await?);

        let offer = session.create_offer().await?;
        let candidates = self.gather(conn, offer.clone()).await?;

        let message = SignalingMessage::Offer {
            from: self.local().virtual_address,
            description: offer,
            candidates,
        };
        self.signaler.send(conn.peer(), &message).await?;
        info!(peer = %conn.peer(), "Offer sent");
        Ok(())
    }

    /// Apply the local description and wait for gathering; returns the
    /// buffered candidates
    async fn gather(&self, conn: &Arc<Connection>, description: SessionDescription) -> Result<Vec<IceCandidate>> {
        conn.session().set_local_description(description).await?;
        if !conn.wait_gathered(self.config.gather_timeout).await {
            warn!(
                peer = %conn.peer(),
                "ICE gathering did not finish within {:?}; sending partial candidates",
                self.config.gather_timeout
            );
        }
        Ok(conn.take_candidates())
    }

    /// Handle an offer from a peer.
    ///
    /// Registers the connection synchronously so duplicates are rejected
    /// immediately; the rest of the negotiation runs in the background.
    pub async fn accept_offer(self: &Arc<Self>, message: SignalingMessage) -> Result<()> {
        let SignalingMessage::Offer {
            from,
            description,
            candidates,
        } = message
        else {
            return Err(Error::ProtocolViolation(
                "expected an offer on /offer_ice".to_string(),
            ));
        };
        if from == self.local().virtual_address {
            return Err(Error::ProtocolViolation("offer from self".to_string()));
        }

        let conn = match self.open_connection(from, Role::Answer).await {
            Ok(conn) => conn,
            Err(e @ Error::DuplicateConnection(_)) => {
                warn!(peer = %from, "Rejecting duplicate offer");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.negotiate_answer(&conn, description, candidates).await {
                warn!(peer = %from, "Answer failed: {}", e);
                this.teardown(&conn, "answer failed").await;
            }
        });
        Ok(())
    }

    async fn negotiate_answer(
        &self,
        conn: &Arc<Connection>,
        offer: SessionDescription,
        candidates: Vec<IceCandidate>,
    ) -> Result<()> {
        let session = Arc::clone(conn.session());

        conn.set_senders(session.add_local_tracks().await?);
        session.set_remote_description(offer).await?;
        let answer = session.create_answer().await?;
        for candidate in candidates {
            session.add_ice_candidate(candidate).await?;
        }
        let local_candidates = self.gather(conn, answer.clone()).await?;

        let message = SignalingMessage::Answer {
            from: self.local().virtual_address,
            description: answer,
            candidates: local_candidates,
        };
        self.signaler.send(conn.peer(), &message).await?;
        info!(peer = %conn.peer(), "Answer sent");
        Ok(())
    }

    /// Apply a peer's answer to the offer we sent
    pub async fn complete_answer(&self, message: SignalingMessage) -> Result<()> {
        let SignalingMessage::Answer {
            from,
            description,
            candidates,
        } = message
        else {
            return Err(Error::ProtocolViolation(
                "expected an answer on /answer_ice".to_string(),
            ));
        };

        let conn = self
            .connection(from)
            .await
            .ok_or(Error::ConnectionNotFound(from))?;

        if conn.role() != Role::Offer {
            warn!(peer = %from, "Answer received for a connection we did not offer");
            self.teardown(&conn, "answer for non-initiator connection").await;
            return Err(Error::RoleMismatch {
                peer: from,
                actual: conn.role(),
            });
        }

        let applied = async {
            conn.session().set_remote_description(description).await?;
            for candidate in candidates {
                conn.session().add_ice_candidate(candidate).await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = applied {
            self.teardown(&conn, "failed to apply answer").await;
            return Err(e);
        }
        info!(peer = %from, "Answer applied");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    /// Spawn only the transport event loop. Returns `None` if it was already
    /// started.
    pub fn spawn_event_loop(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let Some(rx) = self.transport_rx.lock().take() else {
            error!("Transport event loop already running");
            return None;
        };
        let this = Arc::clone(self);
        Some(tokio::spawn(this.run_events(rx, shutdown)))
    }

    async fn run_events(
        self: Arc<Self>,
        mut rx: TransportEventReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Transport event loop stopped");
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        let key = event.key();
        let Some(conn) = self.connection(key.peer).await.filter(|c| c.id() == key.id) else {
            debug!(%key, event = event.name(), "Dropping event from superseded session");
            return;
        };

        match event {
            TransportEvent::IceCandidate { candidate, .. } => conn.buffer_candidate(candidate),
            TransportEvent::GatheringComplete { .. } => {
                debug!(peer = %key.peer, "ICE gathering complete");
                conn.notify_gathered();
            }
            TransportEvent::StateChanged { state, .. } => {
                conn.set_link_state(state);
                self.events.emit(StatusEvent::ConnectionState {
                    state,
                    peer: key.peer,
                });
                match state {
                    LinkState::Connected => {
                        if conn.mark_established() {
                            info!(peer = %key.peer, "Connection established");
                        }
                    }
                    LinkState::Failed => self.teardown(&conn, "transport failed").await,
                    _ => {}
                }
            }
            TransportEvent::DataChannel { channel, .. } => {
                if conn.role() == Role::Offer {
                    warn!(peer = %key.peer, "Ignoring remote data channel '{}' on offering side", channel.label());
                } else if !conn.attach_channel(Arc::clone(&channel)) {
                    warn!(peer = %key.peer, "Ignoring unexpected data channel '{}'", channel.label());
                }
            }
            TransportEvent::ChannelOpen { label, .. } => {
                if label == DATA_CHANNEL_LABEL {
                    if let Some(channel) = conn.data_channel() {
                        self.send_user_state(&conn, &channel).await;
                    }
                }
            }
            TransportEvent::ChannelMessage { label, text, .. } => match label.as_str() {
                PING_CHANNEL_LABEL => self.handle_ping_message(&conn, &text).await,
                DATA_CHANNEL_LABEL => self.handle_peer_message(&conn, &text),
                other => debug!(peer = %key.peer, "Message on unknown channel '{}'", other),
            },
            TransportEvent::ChannelClosed { label, .. } => {
                debug!(peer = %key.peer, "Channel '{}' closed", label);
            }
            TransportEvent::RemoteTrack { track, .. } => {
                spawn_track_reader(key.peer, track, self.media_out.clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // Control channels
    // ------------------------------------------------------------------

    async fn handle_ping_message(&self, conn: &Arc<Connection>, text: &str) {
        match text {
            PING => {
                if let Some(channel) = conn.ping_channel() {
                    if let Err(e) = channel.send_text(PONG).await {
                        debug!(peer = %conn.peer(), "Failed to send pong: {}", e);
                    }
                }
            }
            PONG => match conn.record_pong(Instant::now()) {
                PongOutcome::Latency(rtt) => debug!(peer = %conn.peer(), "Latency {:?}", rtt),
                PongOutcome::Unsolicited => debug!(peer = %conn.peer(), "Pong without outstanding ping"),
                PongOutcome::NonPositive => warn!(peer = %conn.peer(), "Discarding non-positive latency"),
            },
            other => debug!(peer = %conn.peer(), "Unknown ping-channel message {:?}", other),
        }
    }

    fn handle_peer_message(&self, conn: &Arc<Connection>, text: &str) {
        let message = match parse_peer_message(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %conn.peer(), "Dropping malformed peer message: {}", e);
                return;
            }
        };
        let relayed = RelayedMessage::new(message, conn.peer());
        if relayed.kind() == Some(USER_STATE) {
            if let Some(in_chat) = peer_in_chat(&relayed.message) {
                conn.set_in_session(in_chat);
            }
        }
        self.events.emit(MeshEvent::Relayed(relayed));
    }

    /// Send `ping` on every open ping channel and publish the latencies
    /// measured so far
    pub async fn ping_round(&self) {
        let mut latencies = BTreeMap::new();
        for conn in self.connections().await {
            if let Some(latency) = conn.latency() {
                latencies.insert(conn.peer(), latency.as_millis() as u64);
            }
            let Some(channel) = conn.ping_channel() else {
                continue;
            };
            conn.record_ping(Instant::now());
            if let Err(e) = channel.send_text(PING).await {
                debug!(peer = %conn.peer(), "Ping failed: {}", e);
            }
        }
        self.events.emit(StatusEvent::Latency {
            timestamp: unix_now(),
            latencies,
        });
    }

    async fn send_user_state(&self, conn: &Arc<Connection>, channel: &Arc<dyn ControlChannel>) {
        let text = match user_state_message(&self.mirror.get()) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode user state: {}", e);
                return;
            }
        };
        if let Err(e) = channel.send_text(&text).await {
            debug!(peer = %conn.peer(), "Failed to send user state: {}", e);
        }
    }

    /// Push the local user state to every open data channel
    pub async fn broadcast_user_state(&self) -> usize {
        match user_state_message(&self.mirror.get()) {
            Ok(text) => self.send_to_peers(&text, None).await,
            Err(e) => {
                error!("Failed to encode user state: {}", e);
                0
            }
        }
    }

    /// Replace the local state, reallocate bitrates and tell every peer
    pub async fn publish_local_state(&self, state: MirrorState) -> usize {
        self.mirror.replace(state);
        let active = self.mirror.active_streams();
        for conn in self.connections().await {
            conn.refresh_allocation(active);
        }
        self.broadcast_user_state().await
    }

    /// Send `text` on the data channel of every connected peer, or only of
    /// `targets` when given. Returns the number of peers reached.
    pub async fn send_to_peers(&self, text: &str, targets: Option<&[Ipv4Addr]>) -> usize {
        let mut delivered = 0;
        for conn in self.connections().await {
            if let Some(targets) = targets {
                if !targets.contains(&conn.peer()) {
                    continue;
                }
            }
            let Some(channel) = conn.data_channel() else {
                continue;
            };
            match channel.send_text(text).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer = %conn.peer(), "Data channel send failed: {}", e),
            }
        }
        delivered
    }

    // ------------------------------------------------------------------
    // Bandwidth and status
    // ------------------------------------------------------------------

    /// Poll every estimator, publish a `BER` event and reallocate
    pub async fn bandwidth_round(&self) {
        let rates = self.estimators.poll();
        if rates.is_empty() {
            return;
        }

        let active = self.mirror.active_streams();
        for (peer, rate) in &rates {
            if let Some(conn) = self.connection(*peer).await {
                conn.update_bandwidth(*rate, active);
            }
        }

        self.events.emit(StatusEvent::BandwidthReport {
            timestamp: unix_now(),
            target_bitrates: rates,
        });
    }

    pub async fn status_report(&self) -> StatusReport {
        let mut connections: Vec<_> = self
            .connections()
            .await
            .iter()
            .map(|conn| conn.status())
            .collect();
        connections.sort_by_key(|row| row.peer_ip);
        StatusReport {
            timestamp: chrono::Utc::now(),
            total_peers: connections.len(),
            connections,
        }
    }

    pub async fn status_round(&self) {
        let report = self.status_report().await;
        self.events.emit(StatusEvent::RtcStatus(report));
    }
}

/// Run `round` every `period` until shutdown
async fn every<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut round: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => round().await,
            _ = shutdown.changed() => break,
        }
    }
}
