//! Signaling message
//!
//! Wire shape:
//!
//! ```json
//! {
//!   "from": "100.64.0.2",
//!   "role": "offer",
//!   "sdpWithICE": {
//!     "sdp": {"type": "offer", "sdp": "v=0..."},
//!     "iceList": [{"candidate": "...", "sdpMid": "0", "sdpMLineIndex": 0}]
//!   }
//! }
//! ```
//!
//! `role` and the description's `type` must agree; a payload where they differ
//! is rejected during decoding.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::rtc::{IceCandidate, SdpKind, SessionDescription};

/// Which side of the offer/answer exchange a node plays on one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offer,
    Answer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offer => f.write_str("offer"),
            Role::Answer => f.write_str("answer"),
        }
    }
}

/// Offer or answer with the sender's gathered candidates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SignalingPayload", into = "SignalingPayload")]
pub enum SignalingMessage {
    Offer {
        from: Ipv4Addr,
        description: SessionDescription,
        candidates: Vec<IceCandidate>,
    },
    Answer {
        from: Ipv4Addr,
        description: SessionDescription,
        candidates: Vec<IceCandidate>,
    },
}

impl SignalingMessage {
    pub fn from(&self) -> Ipv4Addr {
        match self {
            Self::Offer { from, .. } | Self::Answer { from, .. } => *from,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::Offer { .. } => Role::Offer,
            Self::Answer { .. } => Role::Answer,
        }
    }

    /// Path on the receiving node's signaling server
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer_ice",
            Self::Answer { .. } => "answer_ice",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignalingPayload {
    from: Ipv4Addr,
    role: Role,
    #[serde(rename = "sdpWithICE")]
    sdp_with_ice: SdpWithIce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SdpWithIce {
    sdp: SessionDescription,
    #[serde(rename = "iceList", default)]
    ice_list: Vec<IceCandidate>,
}

impl TryFrom<SignalingPayload> for SignalingMessage {
    type Error = String;

    fn try_from(payload: SignalingPayload) -> Result<Self, Self::Error> {
        let SignalingPayload {
            from,
            role,
            sdp_with_ice: SdpWithIce { sdp, ice_list },
        } = payload;

        match (role, sdp.kind) {
            (Role::Offer, SdpKind::Offer) => Ok(Self::Offer {
                from,
                description: sdp,
                candidates: ice_list,
            }),
            (Role::Answer, SdpKind::Answer) => Ok(Self::Answer {
                from,
                description: sdp,
                candidates: ice_list,
            }),
            (role, kind) => Err(format!(
                "role {} does not match description type {:?}",
                role, kind
            )),
        }
    }
}

impl From<SignalingMessage> for SignalingPayload {
    fn from(message: SignalingMessage) -> Self {
        let role = message.role();
        let (from, sdp, ice_list) = match message {
            SignalingMessage::Offer {
                from,
                description,
                candidates,
            }
            | SignalingMessage::Answer {
                from,
                description,
                candidates,
            } => (from, description, candidates),
        };
        SignalingPayload {
            from,
            role,
            sdp_with_ice: SdpWithIce { sdp, ice_list },
        }
    }
}
