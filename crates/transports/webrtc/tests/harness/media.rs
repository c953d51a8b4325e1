//! Synthetic media frames for bridge and track-reader tests

use std::time::Duration;

use bytes::Bytes;
use meshcall_webrtc::media::{OutboundChunk, TrackId};
use meshcall_webrtc::rtc::RtpChunk;

/// 20 ms Opus frame duration
pub const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// Frame from the local application for an audio track, tagged with the
/// tier it was encoded at
pub fn audio_frame(track: TrackId, bitrate: u32, payload: &'static [u8]) -> Bytes {
    OutboundChunk {
        track,
        duration: AUDIO_FRAME,
        bitrate: Some(bitrate),
        payload: Bytes::from_static(payload),
    }
    .encode()
}

/// Frame from the local application for the screen track
pub fn screen_frame(payload: &'static [u8]) -> Bytes {
    OutboundChunk {
        track: TrackId::ScreenVideo,
        duration: Duration::ZERO,
        bitrate: None,
        payload: Bytes::from_static(payload),
    }
    .encode()
}

/// One RTP payload as a remote sender would produce it
pub fn rtp(timestamp: u32, payload: &'static [u8]) -> RtpChunk {
    RtpChunk {
        timestamp,
        payload: Bytes::from_static(payload),
    }
}
