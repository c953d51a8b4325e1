//! Mesh configuration

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::{Error, Result};

/// Default UDP port for presence datagrams
pub const DEFAULT_UDP_PORT: u16 = 8849;

/// Default TCP port for the signaling HTTP server
pub const DEFAULT_TCP_PORT: u16 = 8848;

/// Configuration shared by the directory, the orchestrator and the signaling client
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Port peers listen on for presence datagrams
    pub udp_port: u16,

    /// Port peers serve `/offer_ice` and `/answer_ice` on
    pub tcp_port: u16,

    /// Presence broadcast and reconciliation period
    pub broadcast_interval: Duration,

    /// Period of the directory expiry sweep
    pub expiry_interval: Duration,

    /// A peer not heard from for longer than this is removed
    pub peer_timeout: Duration,

    /// Ping period on the "ping" channel
    pub ping_interval: Duration,

    /// Backup period for pushing local user state
    pub state_sync_interval: Duration,

    /// Bandwidth estimator polling period
    pub bandwidth_interval: Duration,

    /// `rtc_status` publishing period
    pub status_interval: Duration,

    /// Upper bound on waiting for ICE gathering before sending what we have
    pub gather_timeout: Duration,

    /// A connection still negotiating after this long is torn down and retried
    pub negotiation_timeout: Duration,

    /// HTTP client timeout for signaling requests
    pub signaling_timeout: Duration,

    /// Initial estimate handed to every new bandwidth estimator (bps)
    pub initial_bitrate: u64,

    /// Lower clamp for bandwidth estimates (bps)
    pub min_bitrate: u64,

    /// Upper clamp for bandwidth estimates (bps)
    pub max_bitrate: u64,

    /// Discovery pings sent to a relayed peer per burst
    pub direct_ping_count: u32,

    /// Spacing of discovery pings within a burst
    pub direct_ping_interval: Duration,

    /// After this long, peers that already had a burst may get another
    pub direct_ping_reset_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_UDP_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            broadcast_interval: Duration::from_secs(2),
            expiry_interval: Duration::from_secs(2),
            peer_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(3),
            state_sync_interval: Duration::from_secs(5),
            bandwidth_interval: Duration::from_secs(2),
            status_interval: Duration::from_secs(2),
            gather_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(30),
            signaling_timeout: Duration::from_secs(5),
            initial_bitrate: 600_000,
            min_bitrate: 100_000,
            max_bitrate: 50_000_000,
            direct_ping_count: 10,
            direct_ping_interval: Duration::from_secs(1),
            direct_ping_reset_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl MeshConfig {
    /// Check the invariants the loops rely on
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("broadcast_interval", self.broadcast_interval),
            ("expiry_interval", self.expiry_interval),
            ("ping_interval", self.ping_interval),
            ("state_sync_interval", self.state_sync_interval),
            ("bandwidth_interval", self.bandwidth_interval),
            ("status_interval", self.status_interval),
            ("gather_timeout", self.gather_timeout),
            ("signaling_timeout", self.signaling_timeout),
            ("direct_ping_interval", self.direct_ping_interval),
            ("direct_ping_reset_interval", self.direct_ping_reset_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(Error::ConfigError(format!("{} must be non-zero", name)));
            }
        }

        if self.peer_timeout < self.broadcast_interval * 3 {
            return Err(Error::ConfigError(format!(
                "peer_timeout ({:?}) must be at least 3x broadcast_interval ({:?})",
                self.peer_timeout, self.broadcast_interval
            )));
        }

        if self.negotiation_timeout <= self.gather_timeout {
            return Err(Error::ConfigError(
                "negotiation_timeout must exceed gather_timeout".to_string(),
            ));
        }

        if self.min_bitrate == 0 || self.min_bitrate > self.max_bitrate {
            return Err(Error::ConfigError(format!(
                "invalid bitrate bounds: min {} max {}",
                self.min_bitrate, self.max_bitrate
            )));
        }

        if !(self.min_bitrate..=self.max_bitrate).contains(&self.initial_bitrate) {
            return Err(Error::ConfigError(format!(
                "initial_bitrate {} outside [{}, {}]",
                self.initial_bitrate, self.min_bitrate, self.max_bitrate
            )));
        }

        Ok(())
    }

    /// Where presence datagrams are received. Bound to the overlay address
    /// only, so other interfaces cannot inject peers.
    pub fn presence_addr(&self, local: Ipv4Addr) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(local, self.udp_port))
    }

    /// Where the signaling HTTP server listens
    pub fn signaling_addr(&self, local: Ipv4Addr) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(local, self.tcp_port))
    }
}
