//! Real-time transport seam
//!
//! The orchestrator drives peer connections through [`RtcEngine`] and
//! [`RtcSession`]; everything the transport reports back arrives as a
//! [`TransportEvent`] on one ordered queue. [`engine::WebRtcEngine`] is the
//! production implementation; `mock` (tests and the `test-util` feature)
//! provides in-memory doubles.

pub mod channel;
pub mod engine;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::media::TrackId;
use crate::Result;

pub use channel::WebRtcControlChannel;
pub use engine::WebRtcEngine;

/// Label of the application data channel
pub const DATA_CHANNEL_LABEL: &str = "data";

/// Label of the latency ping channel
pub const PING_CHANNEL_LABEL: &str = "ping";

/// Identifies one connection generation to one peer.
///
/// Events carrying a key whose id no longer matches the live connection for
/// that peer come from a superseded session and are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub peer: Ipv4Addr,
    pub id: u64,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.id)
    }
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description in the `{type, sdp}` wire form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser `RTCIceCandidateInit` wire form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Peer connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::New => "new",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One RTP packet's payload with its media timestamp
#[derive(Debug, Clone)]
pub struct RtpChunk {
    pub timestamp: u32,
    pub payload: Bytes,
}

/// Creates transport sessions
#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Create a session for one connection generation. Every callback of the
    /// session is delivered on `events` tagged with `key`.
    async fn create_session(
        &self,
        key: SessionKey,
        events: TransportEventSender,
    ) -> Result<Arc<dyn RtcSession>>;
}

/// One peer connection
#[async_trait]
pub trait RtcSession: Send + Sync {
    /// Open a locally initiated data channel with handlers already installed
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn ControlChannel>>;

    /// Add the local audio/video tracks and return one sender per track
    async fn add_local_tracks(&self) -> Result<HashMap<TrackId, Arc<dyn MediaSender>>>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply the local description; starts ICE gathering
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn state(&self) -> LinkState;

    async fn close(&self) -> Result<()>;
}

/// Text data channel
#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Writes encoded samples to one local track of one connection
#[async_trait]
pub trait MediaSender: Send + Sync {
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()>;
}

/// A track received from a peer
#[async_trait]
pub trait RemoteTrack: Send + Sync {
    /// Track id the remote sender assigned
    fn id(&self) -> &str;

    /// Read the next RTP packet. An error ends the track.
    async fn read_rtp(&self) -> Result<RtpChunk>;
}

/// Callback from a transport session
pub enum TransportEvent {
    /// Local ICE candidate gathered
    IceCandidate {
        key: SessionKey,
        candidate: IceCandidate,
    },
    /// No more local candidates will be produced
    GatheringComplete { key: SessionKey },
    StateChanged { key: SessionKey, state: LinkState },
    /// Remote side opened a data channel
    DataChannel {
        key: SessionKey,
        channel: Arc<dyn ControlChannel>,
    },
    ChannelOpen { key: SessionKey, label: String },
    ChannelMessage {
        key: SessionKey,
        label: String,
        text: String,
    },
    ChannelClosed { key: SessionKey, label: String },
    RemoteTrack {
        key: SessionKey,
        track: Arc<dyn RemoteTrack>,
    },
}

impl TransportEvent {
    pub fn key(&self) -> SessionKey {
        match self {
            Self::IceCandidate { key, .. }
            | Self::GatheringComplete { key }
            | Self::StateChanged { key, .. }
            | Self::DataChannel { key, .. }
            | Self::ChannelOpen { key, .. }
            | Self::ChannelMessage { key, .. }
            | Self::ChannelClosed { key, .. }
            | Self::RemoteTrack { key, .. } => *key,
        }
    }

    /// Get the event name for logging/debugging
    pub fn name(&self) -> &'static str {
        match self {
            Self::IceCandidate { .. } => "ice_candidate",
            Self::GatheringComplete { .. } => "gathering_complete",
            Self::StateChanged { .. } => "state_changed",
            Self::DataChannel { .. } => "data_channel",
            Self::ChannelOpen { .. } => "channel_open",
            Self::ChannelMessage { .. } => "channel_message",
            Self::ChannelClosed { .. } => "channel_closed",
            Self::RemoteTrack { .. } => "remote_track",
        }
    }
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvent")
            .field("name", &self.name())
            .field("key", &self.key())
            .finish()
    }
}

/// Sending half of the transport event queue
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of the transport event queue
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;
