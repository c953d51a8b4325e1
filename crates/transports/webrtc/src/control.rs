//! Control-channel protocols
//!
//! Latency measurement runs on the "ping" channel with bare `ping`/`pong` text.
//! The "data" channel carries JSON objects with a `type` field: `userState`
//! mirrors a peer's [`MirrorState`], `dm` is a direct message. Anything else
//! is relayed to the local application untouched.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::mirror::MirrorState;
use crate::{Error, Result};

pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/// Type tag of state mirroring messages
pub const USER_STATE: &str = "userState";

/// Type tag of direct messages
pub const DIRECT_MESSAGE: &str = "dm";

/// Result of handling a pong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongOutcome {
    /// Round trip measured
    Latency(Duration),
    /// No ping is outstanding
    Unsolicited,
    /// Clock did not advance between ping and pong
    NonPositive,
}

/// Ping bookkeeping for one connection
#[derive(Debug, Default, Clone)]
pub struct PingTracker {
    outstanding: Option<Instant>,
    last_ping_at: Option<DateTime<Utc>>,
    latency: Option<Duration>,
}

impl PingTracker {
    /// Record that a ping was sent at `at`
    pub fn record_ping(&mut self, at: Instant) {
        self.outstanding = Some(at);
        self.last_ping_at = Some(Utc::now());
    }

    /// Match a pong received at `at` against the outstanding ping
    pub fn record_pong(&mut self, at: Instant) -> PongOutcome {
        let Some(sent) = self.outstanding.take() else {
            return PongOutcome::Unsolicited;
        };
        match at.checked_duration_since(sent) {
            Some(rtt) if !rtt.is_zero() => {
                self.latency = Some(rtt);
                PongOutcome::Latency(rtt)
            }
            _ => PongOutcome::NonPositive,
        }
    }

    /// Last measured round trip
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Wall-clock time of the last ping sent
    pub fn last_ping_at(&self) -> Option<DateTime<Utc>> {
        self.last_ping_at
    }
}

/// `userState` message announcing our state
pub fn user_state_message(state: &MirrorState) -> Result<String> {
    Ok(serde_json::to_string(&json!({
        "type": USER_STATE,
        "userState": state,
    }))?)
}

/// Decode a data-channel message into a JSON object
pub fn parse_peer_message(text: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(text)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::ProtocolViolation(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

/// The peer's in-chat flag from a `userState` message, if present
pub fn peer_in_chat(message: &Map<String, Value>) -> Option<bool> {
    message
        .get("userState")
        .and_then(|state| state.get("isInChat"))
        .and_then(Value::as_bool)
}

/// Message from the local application on the control socket
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeCommand {
    /// Relay the raw text to one peer or to all
    #[serde(rename = "dc")]
    Relay {
        #[serde(rename = "Target", default)]
        target: Option<Ipv4Addr>,
    },

    /// Replace the local mirror state and push it to every peer
    #[serde(rename = "mirrorLocalState")]
    MirrorLocalState {
        #[serde(rename = "userState")]
        user_state: MirrorState,
    },

    /// Direct message to all peers or a subset. Entries are kept as text
    /// so one bad address does not reject the message; see
    /// [`direct_message_targets`].
    #[serde(rename = "dm")]
    DirectMessage {
        #[serde(rename = "targetPeers", default)]
        target_peers: Vec<String>,
    },

    /// Broadcast the raw text to every peer
    #[serde(rename = "userState")]
    UserState,

    /// Request an immediate `rtc_status` event
    #[serde(rename = "getStatus")]
    GetStatus,
}

impl BridgeCommand {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::ProtocolViolation(format!("bad control message: {}", e)))
    }
}

/// Recipients of a direct message. An empty list means every peer
/// (`None`); otherwise the valid addresses, skipping entries that are not
/// IPv4 addresses. A list with no valid entry reaches nobody.
pub fn direct_message_targets(target_peers: &[String]) -> Option<Vec<Ipv4Addr>> {
    if target_peers.is_empty() {
        return None;
    }
    let targets = target_peers
        .iter()
        .filter_map(|entry| match entry.parse::<Ipv4Addr>() {
            Ok(addr) => Some(addr),
            Err(_) => {
                warn!(target = %entry, "Skipping direct message target that is not an IPv4 address");
                None
            }
        })
        .collect();
    Some(targets)
}
