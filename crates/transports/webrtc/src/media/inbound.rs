//! Remote track readers
//!
//! One task per remote track depacketizes RTP and forwards framed chunks to
//! the local application's media queue. Audio is forwarded per packet; video
//! packets are reassembled into whole frames first.

use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::rtp::codecs::opus::OpusPacket;
use webrtc::rtp::codecs::vp9::Vp9Packet;
use webrtc::rtp::packetizer::Depacketizer;

use super::framing::{FrameAssembler, InboundFrame};
use super::TrackId;
use crate::rtc::RemoteTrack;

/// Start reading a remote track. Returns `None` for tracks we do not know.
pub fn spawn_track_reader(
    peer: Ipv4Addr,
    track: Arc<dyn RemoteTrack>,
    outlet: mpsc::Sender<Bytes>,
) -> Option<JoinHandle<()>> {
    let Some(track_id) = TrackId::from_track_label(track.id()) else {
        warn!(%peer, "Ignoring unknown remote track '{}'", track.id());
        return None;
    };
    Some(tokio::spawn(read_track(peer, track_id, track, outlet)))
}

async fn read_track(
    peer: Ipv4Addr,
    track_id: TrackId,
    track: Arc<dyn RemoteTrack>,
    outlet: mpsc::Sender<Bytes>,
) {
    info!(%peer, "Reading remote {} track", track_id);
    let mut depacketizer = PayloadDepacketizer::new(track_id);
    let mut assembler = FrameAssembler::new();

    loop {
        let chunk = match track.read_rtp().await {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(%peer, "Remote {} track ended: {}", track_id, e);
                break;
            }
        };

        let payload = match depacketizer.depacketize(&chunk.payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(%peer, "Skipping {} packet: {}", track_id, e);
                continue;
            }
        };

        let frame = if track_id.is_audio() {
            Some(payload)
        } else {
            assembler.push(chunk.timestamp, &payload)
        };

        if let Some(payload) = frame {
            let framed = InboundFrame {
                track: track_id,
                peer,
                payload,
            }
            .encode();
            if outlet.send(framed).await.is_err() {
                debug!(%peer, "Media outlet closed");
                break;
            }
        }
    }
    info!(%peer, "Remote {} reader stopped", track_id);
}

enum PayloadDepacketizer {
    Opus(OpusPacket),
    Vp9(Vp9Packet),
}

impl PayloadDepacketizer {
    fn new(track: TrackId) -> Self {
        if track.is_audio() {
            PayloadDepacketizer::Opus(OpusPacket)
        } else {
            PayloadDepacketizer::Vp9(Vp9Packet::default())
        }
    }

    fn depacketize(&mut self, payload: &Bytes) -> Result<Bytes, String> {
        let result = match self {
            PayloadDepacketizer::Opus(p) => p.depacketize(payload),
            PayloadDepacketizer::Vp9(p) => p.depacketize(payload),
        };
        result.map_err(|e| e.to_string())
    }
}
