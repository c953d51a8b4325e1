//! Media tracks and the local framing bridge
//!
//! Every connection carries the same three local tracks. The numeric
//! [`TrackId`] is what the local application puts in the first byte of each
//! binary frame; the string ids are what the remote end sees in SDP.

pub mod framing;
pub mod inbound;

pub use framing::{FrameAssembler, InboundFrame, OutboundChunk, SCREEN_FRAME_DURATION};
pub use inbound::spawn_track_reader;

use serde::{Deserialize, Serialize};

/// Codec carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Opus,
    Vp9,
}

impl Codec {
    /// MIME type registered with the media engine
    pub fn mime_type(&self) -> &'static str {
        match self {
            Codec::Opus => "audio/opus",
            Codec::Vp9 => "video/VP9",
        }
    }
}

/// Local track identifier, also used as the allocation stream kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum TrackId {
    /// Microphone audio
    Microphone = 0,
    /// Secondary (system/app) audio
    SystemAudio = 1,
    /// Shared screen video
    ScreenVideo = 2,
}

impl TrackId {
    pub const ALL: [TrackId; 3] = [TrackId::Microphone, TrackId::SystemAudio, TrackId::ScreenVideo];

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(TrackId::Microphone),
            1 => Some(TrackId::SystemAudio),
            2 => Some(TrackId::ScreenVideo),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn is_audio(self) -> bool {
        matches!(self, TrackId::Microphone | TrackId::SystemAudio)
    }

    pub fn codec(self) -> Codec {
        if self.is_audio() {
            Codec::Opus
        } else {
            Codec::Vp9
        }
    }

    /// Track id announced in SDP
    pub fn track_label(self) -> &'static str {
        match self {
            TrackId::Microphone => "microphone-audio",
            TrackId::SystemAudio => "cpa-audio",
            TrackId::ScreenVideo => "screen-share-video",
        }
    }

    /// Media stream id announced in SDP
    pub fn stream_id(self) -> &'static str {
        match self {
            TrackId::Microphone => "microphone",
            TrackId::SystemAudio => "cpa",
            TrackId::ScreenVideo => "screen-share",
        }
    }

    /// Resolve a remote track by the label its sender gave it
    pub fn from_track_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.track_label() == label)
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.track_label())
    }
}
