//! Overlay network status
//!
//! The mesh needs the local virtual address and the list of peers currently
//! online, plus a way to nudge relayed peers onto a direct path.
//! [`TailscaleOverlay`] uses the `tailscale` CLI for all of it;
//! [`StaticOverlay`] serves a fixed list and never pings.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

/// One peer as reported by the overlay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayPeer {
    pub hostname: String,
    pub addresses: Vec<Ipv4Addr>,
    pub online: bool,
    /// Traffic currently goes through a relay instead of a direct path
    pub relayed: bool,
}

/// Overlay status snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayStatus {
    /// Whether the overlay backend is up
    pub running: bool,
    pub peers: Vec<OverlayPeer>,
}

impl OverlayStatus {
    /// First IPv4 address of every online peer
    pub fn online_addresses(&self) -> Vec<Ipv4Addr> {
        self.peers
            .iter()
            .filter(|p| p.online)
            .filter_map(|p| p.addresses.first().copied())
            .collect()
    }

    /// First IPv4 address of every online peer reached through a relay
    pub fn relayed_addresses(&self) -> Vec<Ipv4Addr> {
        self.peers
            .iter()
            .filter(|p| p.online && p.relayed)
            .filter_map(|p| p.addresses.first().copied())
            .collect()
    }
}

/// Source of overlay network status
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Address this node is reachable at on the overlay
    fn local_address(&self) -> Ipv4Addr;

    /// Current peer list
    async fn status(&self) -> Result<OverlayStatus>;

    /// Send one discovery ping to `peer` to encourage a direct path
    async fn ping(&self, _peer: Ipv4Addr) -> Result<()> {
        Ok(())
    }
}

/// Fixed peer list; always reports running
///
/// The local address is never reported as a peer:
///
/// ```
/// # tokio_test::block_on(async {
/// use std::net::Ipv4Addr;
/// use meshcall_webrtc::{Overlay, StaticOverlay};
///
/// let local = Ipv4Addr::new(10, 0, 0, 1);
/// let peer = Ipv4Addr::new(10, 0, 0, 2);
/// let overlay = StaticOverlay::new(local, vec![local, peer]);
///
/// let status = overlay.status().await.unwrap();
/// assert!(status.running);
/// assert_eq!(status.online_addresses(), vec![peer]);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct StaticOverlay {
    local: Ipv4Addr,
    peers: Vec<Ipv4Addr>,
}

impl StaticOverlay {
    pub fn new(local: Ipv4Addr, peers: Vec<Ipv4Addr>) -> Self {
        Self { local, peers }
    }
}

#[async_trait]
impl Overlay for StaticOverlay {
    fn local_address(&self) -> Ipv4Addr {
        self.local
    }

    async fn status(&self) -> Result<OverlayStatus> {
        Ok(OverlayStatus {
            running: true,
            peers: self
                .peers
                .iter()
                .filter(|addr| **addr != self.local)
                .map(|addr| OverlayPeer {
                    hostname: addr.to_string(),
                    addresses: vec![*addr],
                    online: true,
                    relayed: false,
                })
                .collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TailscaleStatusJson {
    #[serde(default)]
    backend_state: String,
    #[serde(rename = "Self")]
    self_node: Option<TailscaleNodeJson>,
    #[serde(default)]
    peer: Option<HashMap<String, TailscaleNodeJson>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TailscaleNodeJson {
    #[serde(default)]
    host_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Vec<IpAddr>,
    #[serde(default)]
    online: bool,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    cur_addr: String,
    #[serde(default)]
    relay: String,
}

impl TailscaleNodeJson {
    fn ipv4_addresses(&self) -> Vec<Ipv4Addr> {
        self.tailscale_ips
            .iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
            .collect()
    }

    /// Active, with no direct endpoint but a relay region in use
    fn is_relayed(&self) -> bool {
        self.active && self.cur_addr.is_empty() && !self.relay.is_empty()
    }
}

/// Parsed `tailscale status --json` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailscaleSnapshot {
    pub local_address: Option<Ipv4Addr>,
    pub status: OverlayStatus,
}

/// Parse the JSON printed by `tailscale status --json`
pub fn parse_tailscale_status(json: &[u8]) -> Result<TailscaleSnapshot> {
    let parsed: TailscaleStatusJson = serde_json::from_slice(json)?;

    let local_address = parsed
        .self_node
        .as_ref()
        .and_then(|node| node.ipv4_addresses().first().copied());

    let mut peers: Vec<OverlayPeer> = parsed
        .peer
        .unwrap_or_default()
        .into_values()
        .map(|node| OverlayPeer {
            addresses: node.ipv4_addresses(),
            online: node.online,
            relayed: node.is_relayed(),
            hostname: node.host_name,
        })
        .collect();
    peers.sort_by(|a, b| a.addresses.cmp(&b.addresses));

    Ok(TailscaleSnapshot {
        local_address,
        status: OverlayStatus {
            running: parsed.backend_state == "Running",
            peers,
        },
    })
}

/// Overlay backed by the `tailscale` CLI
#[derive(Debug, Clone)]
pub struct TailscaleOverlay {
    binary: String,
    local: Ipv4Addr,
}

impl TailscaleOverlay {
    /// Query the CLI once to learn the local address
    pub async fn discover(binary: impl Into<String>) -> Result<Self> {
        let binary = binary.into();
        let snapshot = parse_tailscale_status(&run_status(&binary).await?)?;
        let local = snapshot.local_address.ok_or_else(|| {
            Error::OverlayError("tailscale reports no IPv4 address for this node".to_string())
        })?;
        debug!(%local, "Discovered overlay address");
        Ok(Self { binary, local })
    }
}

async fn run_status(binary: &str) -> Result<Vec<u8>> {
    let output = Command::new(binary)
        .args(["status", "--json"])
        .output()
        .await
        .map_err(|e| Error::OverlayError(format!("failed to run {}: {}", binary, e)))?;
    if !output.status.success() {
        return Err(Error::OverlayError(format!(
            "{} status exited with {}: {}",
            binary,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

#[async_trait]
impl Overlay for TailscaleOverlay {
    fn local_address(&self) -> Ipv4Addr {
        self.local
    }

    async fn status(&self) -> Result<OverlayStatus> {
        let output = run_status(&self.binary).await?;
        Ok(parse_tailscale_status(&output)?.status)
    }

    async fn ping(&self, peer: Ipv4Addr) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(["ping", "-c", "1", "--timeout", "2s"])
            .arg(peer.to_string())
            .output()
            .await
            .map_err(|e| Error::OverlayError(format!("failed to run {}: {}", self.binary, e)))?;
        if !output.status.success() {
            return Err(Error::OverlayError(format!(
                "{} ping {} exited with {}: {}",
                self.binary,
                peer,
                output.status,
                String::from_utf8_lossy(&output.stdout).trim()
            )));
        }
        Ok(())
    }
}
