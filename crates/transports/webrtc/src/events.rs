//! Events published to the local application bridge
//!
//! Everything the mesh reports upward (directory snapshots, transport state,
//! latency, bandwidth, status, and relayed peer messages) flows through one
//! [`EventSender`] as a [`MeshEvent`]. The bridge server serializes each event
//! to a single JSON text message.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::directory::PeerRecord;
use crate::rtc::LinkState;
use crate::signaling::Role;

/// Event sent to the local application
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MeshEvent {
    /// Event originating from this node
    Status(StatusEvent),
    /// Message received from a peer's data channel, tagged with its sender
    Relayed(RelayedMessage),
}

/// Events generated locally, tagged by `type`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StatusEvent {
    /// Current directory snapshot
    #[serde(rename = "onlinePeers")]
    OnlinePeers {
        peers: BTreeMap<Ipv4Addr, PeerRecord>,
    },

    /// Transport state change on one connection
    #[serde(rename = "connection_state")]
    ConnectionState {
        state: LinkState,
        #[serde(rename = "peerIP")]
        peer: Ipv4Addr,
    },

    /// Round-trip latency per peer in milliseconds
    #[serde(rename = "latency")]
    Latency {
        timestamp: i64,
        latencies: BTreeMap<Ipv4Addr, u64>,
    },

    /// Bandwidth estimate report
    #[serde(rename = "BER")]
    BandwidthReport {
        timestamp: i64,
        #[serde(rename = "targetBitrates")]
        target_bitrates: BTreeMap<Ipv4Addr, u64>,
    },

    /// Connection table overview
    #[serde(rename = "rtc_status")]
    RtcStatus(StatusReport),
}

/// Body of the `rtc_status` event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub total_peers: usize,
    pub connections: Vec<ConnectionStatus>,
}

/// One row of [`StatusReport`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    #[serde(rename = "peerIP")]
    pub peer_ip: Ipv4Addr,
    pub role: Role,
    pub state: LinkState,
    pub created_at: DateTime<Utc>,
    pub last_ping_time: Option<DateTime<Utc>>,
    /// Milliseconds; absent until a pong has been measured
    pub latency: Option<u64>,
    pub has_data_channel: bool,
    pub data_channel_ready: bool,
}

/// Peer message forwarded to the application with its origin attached
#[derive(Debug, Clone, Serialize)]
pub struct RelayedMessage {
    #[serde(flatten)]
    pub message: Map<String, Value>,
    pub from: Ipv4Addr,
}

impl RelayedMessage {
    /// Wrap a decoded peer message. Any `from` field the peer supplied is
    /// replaced by the address the message actually arrived from.
    pub fn new(mut message: Map<String, Value>, from: Ipv4Addr) -> Self {
        message.remove("from");
        Self { message, from }
    }

    /// The peer message's `type` field, if it has one
    pub fn kind(&self) -> Option<&str> {
        self.message.get("type").and_then(Value::as_str)
    }
}

impl MeshEvent {
    /// Get the event name for logging/debugging
    pub fn name(&self) -> &str {
        match self {
            Self::Status(StatusEvent::OnlinePeers { .. }) => "onlinePeers",
            Self::Status(StatusEvent::ConnectionState { .. }) => "connection_state",
            Self::Status(StatusEvent::Latency { .. }) => "latency",
            Self::Status(StatusEvent::BandwidthReport { .. }) => "BER",
            Self::Status(StatusEvent::RtcStatus(_)) => "rtc_status",
            Self::Relayed(relayed) => relayed.kind().unwrap_or("relayed"),
        }
    }

    /// Serialize as the JSON text sent to the bridge client
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<StatusEvent> for MeshEvent {
    fn from(event: StatusEvent) -> Self {
        MeshEvent::Status(event)
    }
}

/// Lossy sender for bridge events.
///
/// Events are periodic or advisory, so a full queue drops the event instead of
/// stalling the loop that produced it.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<MeshEvent>,
}

impl EventSender {
    /// Create a sender and the receiver the bridge server drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MeshEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an event for the bridge
    pub fn emit(&self, event: impl Into<MeshEvent>) {
        let event = event.into();
        let name = event.name().to_string();
        if let Err(e) = self.tx.try_send(event) {
            debug!(event = %name, "Dropping bridge event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connection_state_shape() {
        let event = MeshEvent::from(StatusEvent::ConnectionState {
            state: LinkState::Connected,
            peer: Ipv4Addr::new(100, 64, 0, 2),
        });
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({"type": "connection_state", "state": "connected", "peerIP": "100.64.0.2"})
        );
        assert_eq!(event.name(), "connection_state");
    }

    #[test]
    fn test_bandwidth_report_shape() {
        let mut target_bitrates = BTreeMap::new();
        target_bitrates.insert(Ipv4Addr::new(100, 64, 0, 3), 600_000);
        let event = MeshEvent::from(StatusEvent::BandwidthReport {
            timestamp: 10,
            target_bitrates,
        });
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "BER");
        assert_eq!(value["targetBitrates"]["100.64.0.3"], 600_000);
    }

    #[test]
    fn test_relayed_message_overrides_from() {
        let message = json!({"type": "dm", "content": "hi", "from": "1.2.3.4"});
        let Value::Object(map) = message else {
            panic!("Expected object");
        };
        let event = MeshEvent::Relayed(RelayedMessage::new(map, Ipv4Addr::new(100, 64, 0, 7)));
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "dm");
        assert_eq!(value["content"], "hi");
        assert_eq!(value["from"], "100.64.0.7");
        assert_eq!(event.name(), "dm");
    }

    #[test]
    fn test_rtc_status_shape() {
        let now = Utc::now();
        let report = StatusReport {
            timestamp: now,
            total_peers: 1,
            connections: vec![ConnectionStatus {
                peer_ip: Ipv4Addr::new(100, 64, 0, 4),
                role: Role::Offer,
                state: LinkState::Connecting,
                created_at: now,
                last_ping_time: None,
                latency: Some(12),
                has_data_channel: true,
                data_channel_ready: false,
            }],
        };
        let event = MeshEvent::from(StatusEvent::RtcStatus(report));
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "rtc_status");
        assert_eq!(value["totalPeers"], 1);
        let row = &value["connections"][0];
        assert_eq!(row["peerIP"], "100.64.0.4");
        assert_eq!(row["role"], "offer");
        assert_eq!(row["state"], "connecting");
        assert_eq!(row["latency"], 12);
        assert_eq!(row["hasDataChannel"], true);
        assert_eq!(row["dataChannelReady"], false);
        assert!(row["lastPingTime"].is_null());
    }

    #[tokio::test]
    async fn test_emit_drops_when_full() {
        let (sender, mut rx) = EventSender::channel(1);
        for _ in 0..3 {
            sender.emit(StatusEvent::Latency {
                timestamp: 0,
                latencies: BTreeMap::new(),
            });
        }
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
