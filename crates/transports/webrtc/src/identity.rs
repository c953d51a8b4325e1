//! Node identity and initiator selection
//!
//! Every node advertises a [`NodeIdentity`] in its presence broadcasts. Two
//! nodes that see each other compare identities to decide which one sends the
//! offer, so exactly one side initiates without any extra round trip.

use std::cmp::Ordering;
use std::net::Ipv4Addr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Current UTC time in unix seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Identity of a mesh node, fixed for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub hostname: String,

    /// Process start, unix seconds
    pub start_time: i64,

    /// Per-process random value used when start times collide
    pub random_id: u64,

    #[serde(rename = "tailscale_ip")]
    pub virtual_address: Ipv4Addr,
}

/// Outcome of comparing the local identity against a peer's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiation {
    /// Local node sends the offer
    Initiate,
    /// Local node waits for the peer's offer
    Await,
    /// Start time and random id are both equal; neither side initiates
    Unresolved,
}

impl NodeIdentity {
    /// Identity stamped with the current time and a fresh OS-random id
    pub fn generate(hostname: impl Into<String>, virtual_address: Ipv4Addr) -> Self {
        Self {
            hostname: hostname.into(),
            start_time: unix_now(),
            random_id: rand::rngs::OsRng.next_u64(),
            virtual_address,
        }
    }

    /// Whether `other` was announced by the same process. A node restarted
    /// on the same address gets a new start time and random id.
    pub fn same_process(&self, other: &NodeIdentity) -> bool {
        self.start_time == other.start_time && self.random_id == other.random_id
    }

    /// Decide whether this node initiates toward `peer`.
    ///
    /// The later-started node initiates; ties on start time fall back to the
    /// larger random id. The relation is antisymmetric, so the two ends of a
    /// link always reach opposite answers unless both fields are equal.
    pub fn initiation_toward(&self, peer: &NodeIdentity) -> Initiation {
        match self
            .start_time
            .cmp(&peer.start_time)
            .then(self.random_id.cmp(&peer.random_id))
        {
            Ordering::Greater => Initiation::Initiate,
            Ordering::Less => Initiation::Await,
            Ordering::Equal => Initiation::Unresolved,
        }
    }
}
