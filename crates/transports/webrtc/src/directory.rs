//! Peer directory
//!
//! Liveness-bounded table of online peers. Nodes announce their
//! [`NodeIdentity`] over UDP to every address the overlay reports online;
//! receivers refresh a [`PeerRecord`] stamped with their own clock, and a
//! periodic sweep drops records that have not been refreshed within the
//! peer timeout.
//!
//! Time-dependent operations take an explicit `now` (unix seconds) so the
//! expiry boundary is testable without sleeping.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::direct_path::DirectPathPromoter;
use crate::events::{EventSender, StatusEvent};
use crate::identity::{unix_now, NodeIdentity};
use crate::overlay::Overlay;
use crate::Result;

/// Receive buffer for presence datagrams
const PRESENCE_BUFFER_SIZE: usize = 1024;

/// Presence datagram as sent on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub node_info: NodeIdentity,
    /// Sender's clock, unix seconds. Informational only.
    pub timestamp: i64,
}

/// A peer the directory currently believes is online
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub node_info: NodeIdentity,
    /// Receiver's clock at the most recent presence, unix seconds
    #[serde(rename = "timestamp")]
    pub last_seen: i64,
}

/// Table of online peers keyed by virtual address
pub struct PeerDirectory {
    local: NodeIdentity,
    peer_timeout: Duration,
    peers: RwLock<HashMap<Ipv4Addr, PeerRecord>>,
}

impl PeerDirectory {
    pub fn new(local: NodeIdentity, peer_timeout: Duration) -> Self {
        Self {
            local,
            peer_timeout,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// This node's identity
    pub fn local(&self) -> &NodeIdentity {
        &self.local
    }

    /// Insert or refresh a peer. Returns `true` when the peer was not known.
    ///
    /// Repeated upserts are idempotent apart from `last_seen`, which only
    /// moves forward.
    pub fn upsert(&self, identity: NodeIdentity, now: i64) -> bool {
        let mut peers = self.peers.write();
        match peers.get_mut(&identity.virtual_address) {
            Some(record) => {
                record.last_seen = record.last_seen.max(now);
                record.node_info = identity;
                false
            }
            None => {
                peers.insert(
                    identity.virtual_address,
                    PeerRecord {
                        node_info: identity,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Remove every record with `now - last_seen > peer_timeout`.
    /// Returns the removed addresses.
    pub fn expire(&self, now: i64) -> Vec<Ipv4Addr> {
        let timeout = self.peer_timeout.as_secs() as i64;
        let mut expired = Vec::new();
        self.peers.write().retain(|addr, record| {
            let alive = now - record.last_seen <= timeout;
            if !alive {
                expired.push(*addr);
            }
            alive
        });
        expired
    }

    /// Point-in-time copy of the table
    pub fn snapshot(&self) -> BTreeMap<Ipv4Addr, PeerRecord> {
        self.peers
            .read()
            .iter()
            .map(|(addr, record)| (*addr, record.clone()))
            .collect()
    }

    pub fn get(&self, addr: &Ipv4Addr) -> Option<PeerRecord> {
        self.peers.read().get(addr).cloned()
    }

    pub fn contains(&self, addr: &Ipv4Addr) -> bool {
        self.peers.read().contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Presence message announcing this node
    pub fn presence(&self, now: i64) -> Presence {
        Presence {
            node_info: self.local.clone(),
            timestamp: now,
        }
    }

    /// Decode a presence datagram and upsert its sender.
    ///
    /// Presences carrying our own address are ignored.
    pub fn handle_datagram(&self, data: &[u8], now: i64) -> Result<Option<Ipv4Addr>> {
        let presence: Presence = serde_json::from_slice(data)?;
        let addr = presence.node_info.virtual_address;
        if addr == self.local.virtual_address {
            return Ok(None);
        }
        if self.upsert(presence.node_info, now) {
            info!(peer = %addr, "Peer came online");
        }
        Ok(Some(addr))
    }
}

/// Drives the directory's network loops
pub struct DirectoryService {
    directory: Arc<PeerDirectory>,
    overlay: Arc<dyn Overlay>,
    socket: Arc<UdpSocket>,
    events: EventSender,
    promoter: Arc<DirectPathPromoter>,
    config: MeshConfig,
}

impl DirectoryService {
    pub fn new(
        directory: Arc<PeerDirectory>,
        overlay: Arc<dyn Overlay>,
        socket: Arc<UdpSocket>,
        events: EventSender,
        config: MeshConfig,
    ) -> Self {
        let promoter = DirectPathPromoter::new(
            Arc::clone(&overlay),
            config.direct_ping_count,
            config.direct_ping_interval,
        );
        Self {
            directory,
            overlay,
            socket,
            events,
            promoter,
            config,
        }
    }

    pub fn promoter(&self) -> &Arc<DirectPathPromoter> {
        &self.promoter
    }

    /// Spawn the publish, listen, expiry, report and ping-reset loops
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(&self).run_publisher(shutdown.clone())),
            tokio::spawn(Arc::clone(&self).run_listener(shutdown.clone())),
            tokio::spawn(Arc::clone(&self).run_expiry(shutdown.clone())),
            tokio::spawn(Arc::clone(&self).run_reporter(shutdown.clone())),
            tokio::spawn(self.run_ping_reset(shutdown)),
        ]
    }

    /// Send one presence datagram to every online overlay peer, and start
    /// discovery pings toward known peers that are still relayed
    pub async fn publish_round(&self) {
        let status = match self.overlay.status().await {
            Ok(status) => status,
            Err(e) => {
                warn!("Skipping presence round, overlay status failed: {}", e);
                return;
            }
        };
        if !status.running {
            debug!("Skipping presence round, overlay backend not running");
            return;
        }

        let payload = match serde_json::to_vec(&self.directory.presence(unix_now())) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode presence: {}", e);
                return;
            }
        };

        let local = self.directory.local().virtual_address;
        for addr in status.online_addresses() {
            if addr == local {
                continue;
            }
            let target = SocketAddr::V4(SocketAddrV4::new(addr, self.config.udp_port));
            if let Err(e) = self.socket.send_to(&payload, target).await {
                debug!(peer = %addr, "Presence send failed: {}", e);
            }
        }

        self.promoter.check(&status, |addr| self.directory.contains(addr));
    }

    async fn run_publisher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.broadcast_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.publish_round().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("Presence publisher stopped");
    }

    async fn run_listener(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; PRESENCE_BUFFER_SIZE];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        if let Err(e) = self.directory.handle_datagram(&buf[..len], unix_now()) {
                            warn!(%from, "Dropping malformed presence: {}", e);
                        }
                    }
                    Err(e) if is_transient(&e) => {
                        debug!("Transient presence receive error: {}", e);
                    }
                    Err(e) => {
                        warn!("Presence socket closed: {}", e);
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Presence listener stopped");
    }

    async fn run_expiry(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.expiry_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.directory.expire(unix_now());
                    for addr in &expired {
                        info!(peer = %addr, "Peer went offline");
                    }
                    if !expired.is_empty() {
                        self.events.emit(StatusEvent::OnlinePeers {
                            peers: self.directory.snapshot(),
                        });
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_reporter(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.broadcast_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.events.emit(StatusEvent::OnlinePeers {
                        peers: self.directory.snapshot(),
                    });
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_ping_reset(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.direct_ping_reset_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reset = self.promoter.reset_pinged();
                    debug!(reset, "Cleared finished discovery ping bursts");
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

/// Receive errors that leave an unconnected UDP socket usable, such as ICMP
/// port-unreachable reports surfacing as resets on some platforms
pub fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
