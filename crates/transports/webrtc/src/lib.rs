//! Self-healing WebRTC full mesh over a private overlay network
//!
//! Every node on the overlay announces itself over UDP, learns who else is
//! online, and keeps exactly one peer connection to each of them. Outgoing
//! audio bitrates follow the measured bandwidth of each link.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Local application (WebSocket bridge: /msg and /)        │
//! │  ↕ LocalBridge / EventSender / media outlet              │
//! │  MeshOrchestrator                                        │
//! │  ├─ PeerDirectory ← DirectoryService presence datagrams  │
//! │  ├─ Connection per peer                                  │
//! │  │   ├─ "data" and "ping" control channels               │
//! │  │   └─ microphone / cpa / screen-share senders          │
//! │  ├─ EstimatorPool → allocation tiers                     │
//! │  └─ HTTP signaling (/offer_ice, /answer_ice)             │
//! │     ↕                                                    │
//! │  RtcEngine (webrtc crate, muxed UDP4 ICE)                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use meshcall_webrtc::MeshConfig;
//!
//! let config = MeshConfig::default();
//! assert!(config.validate().is_ok());
//! assert_eq!(config.udp_port, 8849);
//! ```

#![warn(clippy::all)]

pub mod allocation;
pub mod bandwidth;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod control;
pub mod direct_path;
pub mod directory;
pub mod error;
pub mod events;
pub mod identity;
pub mod media;
pub mod mirror;
pub mod orchestrator;
pub mod overlay;
pub mod rtc;
pub mod signaling;

pub use bandwidth::EstimatorPool;
pub use bridge::LocalBridge;
pub use config::MeshConfig;
pub use directory::{DirectoryService, PeerDirectory};
pub use error::{Error, Result};
pub use events::{EventSender, MeshEvent, StatusEvent};
pub use identity::NodeIdentity;
pub use mirror::{MirrorState, SharedMirror};
pub use orchestrator::{MeshContext, MeshOrchestrator};
pub use overlay::{Overlay, StaticOverlay, TailscaleOverlay};
pub use rtc::WebRtcEngine;
pub use signaling::HttpSignaler;

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
