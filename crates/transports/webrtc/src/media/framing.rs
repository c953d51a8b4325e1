//! Binary framing between the mesh and the local application
//!
//! Outbound (application to mesh):
//!
//! ```text
//! +-------+------------------+----------------+---------+
//! | track | duration_ns u64  | bitrate u32    | payload |
//! | u8    | little endian    | LE, audio only |         |
//! +-------+------------------+----------------+---------+
//! ```
//!
//! The duration slot is always present; screen frames ignore its value and use
//! a fixed 1/30 s.
//!
//! Inbound (mesh to application): `track u8 | peer IPv4 (4 bytes) | payload`.

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::TrackId;
use crate::{Error, Result};

/// Sample duration used for every screen frame
pub const SCREEN_FRAME_DURATION: Duration = Duration::from_nanos(1_000_000_000 / 30);

const TRACK_LEN: usize = 1;
const DURATION_LEN: usize = 8;
const BITRATE_LEN: usize = 4;
const ADDRESS_LEN: usize = 4;

/// One encoded chunk received from the local application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundChunk {
    pub track: TrackId,
    pub duration: Duration,
    /// Encoder bitrate tag, present on audio chunks only
    pub bitrate: Option<u32>,
    pub payload: Bytes,
}

impl OutboundChunk {
    fn header_len(track: TrackId) -> usize {
        TRACK_LEN + DURATION_LEN + if track.is_audio() { BITRATE_LEN } else { 0 }
    }

    /// Parse a frame from the local bridge
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.is_empty() {
            return Err(Error::InvalidFrame("empty frame".to_string()));
        }
        let track = TrackId::from_byte(frame[0])
            .ok_or_else(|| Error::InvalidFrame(format!("unknown track id {}", frame[0])))?;

        let header_len = Self::header_len(track);
        if frame.len() < header_len {
            return Err(Error::InvalidFrame(format!(
                "{} frame is {} bytes, header needs {}",
                track,
                frame.len(),
                header_len
            )));
        }

        frame.advance(TRACK_LEN);
        let duration_ns = frame.get_u64_le();
        let duration = match track {
            TrackId::ScreenVideo => SCREEN_FRAME_DURATION,
            _ => Duration::from_nanos(duration_ns),
        };
        let bitrate = track.is_audio().then(|| frame.get_u32_le());

        Ok(Self {
            track,
            duration,
            bitrate,
            payload: frame,
        })
    }

    /// Encode in the outbound layout
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::header_len(self.track) + self.payload.len());
        buf.put_u8(self.track.as_byte());
        buf.put_u64_le(self.duration.as_nanos() as u64);
        if self.track.is_audio() {
            buf.put_u32_le(self.bitrate.unwrap_or_default());
        }
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// A depacketized frame from a remote peer, addressed to the local application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub track: TrackId,
    pub peer: Ipv4Addr,
    pub payload: Bytes,
}

impl InboundFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TRACK_LEN + ADDRESS_LEN + self.payload.len());
        buf.put_u8(self.track.as_byte());
        buf.put_slice(&self.peer.octets());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.len() < TRACK_LEN + ADDRESS_LEN {
            return Err(Error::InvalidFrame(format!(
                "inbound frame is {} bytes",
                frame.len()
            )));
        }
        let track = TrackId::from_byte(frame.get_u8())
            .ok_or_else(|| Error::InvalidFrame("unknown track id".to_string()))?;
        let mut octets = [0u8; ADDRESS_LEN];
        frame.copy_to_slice(&mut octets);
        Ok(Self {
            track,
            peer: Ipv4Addr::from(octets),
            payload: frame,
        })
    }
}

/// Reassembles video frames split across RTP packets.
///
/// Packets sharing an RTP timestamp belong to one frame; the buffered frame is
/// released when the first packet of the next timestamp arrives.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    current_timestamp: Option<u32>,
    buffer: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a depacketized payload; returns the previous frame if this packet
    /// starts a new one
    pub fn push(&mut self, timestamp: u32, payload: &[u8]) -> Option<Bytes> {
        let completed = match self.current_timestamp {
            Some(current) if current != timestamp && !self.buffer.is_empty() => {
                Some(self.buffer.split().freeze())
            }
            _ => None,
        };
        self.current_timestamp = Some(timestamp);
        self.buffer.extend_from_slice(payload);
        completed
    }

    /// Bytes held for the frame in progress
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}
