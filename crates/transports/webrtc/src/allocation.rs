//! Bitrate allocation across concurrent streams
//!
//! Maps one link's estimated bitrate onto a discrete encoder tier per active
//! stream. Video takes priority: when the screen is shared every audio stream
//! drops to its lowest tier and video gets what remains.

use std::collections::BTreeMap;

use crate::media::TrackId;

/// Opus encoder tiers, ascending
pub const AUDIO_TIERS: [u32; 3] = [32_000, 64_000, 128_000];

/// VP9 encoder tiers, ascending
pub const VIDEO_TIERS: [u32; 3] = [300_000, 1_000_000, 5_000_000];

/// Target bitrate per stream
pub type Allocation = BTreeMap<TrackId, u32>;

/// Which local streams are currently being sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveStreams {
    pub microphone: bool,
    pub system_audio: bool,
    pub screen: bool,
}

impl ActiveStreams {
    pub fn is_empty(&self) -> bool {
        !(self.microphone || self.system_audio || self.screen)
    }

    fn active_audio(&self) -> Vec<TrackId> {
        let mut tracks = Vec::with_capacity(2);
        if self.microphone {
            tracks.push(TrackId::Microphone);
        }
        if self.system_audio {
            tracks.push(TrackId::SystemAudio);
        }
        tracks
    }
}

/// Highest tier not above `budget`, never below the lowest tier
pub fn select_tier(tiers: &[u32], budget: u64) -> u32 {
    let lowest = tiers.first().copied().unwrap_or_default();
    tiers
        .iter()
        .rev()
        .copied()
        .find(|&tier| tier as u64 <= budget)
        .unwrap_or(lowest)
}

/// Allocate `total` bits per second across the active streams
pub fn allocate(total: u64, active: ActiveStreams) -> Allocation {
    let mut allocation = Allocation::new();
    let audio = active.active_audio();

    if active.screen {
        for track in &audio {
            allocation.insert(*track, AUDIO_TIERS[0]);
        }
        let audio_consumed = AUDIO_TIERS[0] as u64 * audio.len() as u64;
        let remaining = total.saturating_sub(audio_consumed);
        allocation.insert(TrackId::ScreenVideo, select_tier(&VIDEO_TIERS, remaining));
        return allocation;
    }

    let share = match audio.len() {
        0 => return allocation,
        n => total / n as u64,
    };
    for track in audio {
        allocation.insert(track, select_tier(&AUDIO_TIERS, share));
    }
    allocation
}
