//! Direct path promotion
//!
//! Peers the overlay reaches only through a relay get a short burst of
//! discovery pings, which usually makes the overlay punch a direct path.
//! Each peer is pinged once per burst; finished peers are eligible again
//! after [`DirectPathPromoter::reset_pinged`].

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::overlay::{Overlay, OverlayStatus};

/// Promotion progress for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingState {
    Pinging,
    Pinged,
}

pub struct DirectPathPromoter {
    overlay: Arc<dyn Overlay>,
    states: Mutex<HashMap<Ipv4Addr, PingState>>,
    count: u32,
    interval: Duration,
}

impl DirectPathPromoter {
    pub fn new(overlay: Arc<dyn Overlay>, count: u32, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            overlay,
            states: Mutex::new(HashMap::new()),
            count,
            interval,
        })
    }

    /// Start a ping burst for every relayed peer accepted by `known` that has
    /// no burst running or finished. Returns the peers started.
    pub fn check(self: &Arc<Self>, status: &OverlayStatus, known: impl Fn(&Ipv4Addr) -> bool) -> Vec<Ipv4Addr> {
        let mut started = Vec::new();
        {
            let mut states = self.states.lock();
            for peer in status.relayed_addresses() {
                if !known(&peer) || states.contains_key(&peer) {
                    continue;
                }
                states.insert(peer, PingState::Pinging);
                started.push(peer);
            }
        }

        for peer in &started {
            info!(%peer, "Peer is relayed, pinging to promote a direct path");
            tokio::spawn(Arc::clone(self).ping_burst(*peer));
        }
        started
    }

    async fn ping_burst(self: Arc<Self>, peer: Ipv4Addr) {
        let mut ticker = tokio::time::interval(self.interval);
        for _ in 0..self.count {
            ticker.tick().await;
            if let Err(e) = self.overlay.ping(peer).await {
                debug!(%peer, "Discovery ping failed: {}", e);
            }
        }
        self.states.lock().insert(peer, PingState::Pinged);
        debug!(%peer, pings = self.count, "Finished discovery pings");
    }

    pub fn state(&self, peer: Ipv4Addr) -> Option<PingState> {
        self.states.lock().get(&peer).copied()
    }

    /// Forget finished bursts so those peers can be pinged again. Returns
    /// how many were reset.
    pub fn reset_pinged(&self) -> usize {
        let mut states = self.states.lock();
        let before = states.len();
        states.retain(|_, state| *state == PingState::Pinging);
        before - states.len()
    }
}
