//! Per-link bandwidth estimation
//!
//! Every transport session produces one estimator. The session is created
//! before the orchestrator knows it will keep it, so estimators wait in a FIFO
//! pending queue and the next connection to be registered claims the oldest.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Source of a target bitrate for one link
pub trait BandwidthEstimator: Send + Sync {
    /// Current target bitrate in bits per second
    fn target_bitrate(&self) -> u64;
}

/// Loss threshold above which the estimate backs off
const HIGH_LOSS: f64 = 0.10;

/// Loss threshold below which the estimate grows
const LOW_LOSS: f64 = 0.02;

/// Multiplicative increase applied per clean report
const INCREASE_FACTOR: f64 = 1.08;

/// Estimator driven by RTCP feedback the remote receiver sends for our tracks.
///
/// Receiver reports move the estimate with a loss-based rule (back off above
/// 10% loss, grow 8% below 2%), and REMB messages cap it. The result is
/// clamped to the configured bounds.
#[derive(Debug)]
pub struct RtcpFeedbackEstimator {
    bitrate: AtomicU64,
    remb_cap: AtomicU64,
    min: u64,
    max: u64,
}

impl RtcpFeedbackEstimator {
    pub fn new(initial: u64, min: u64, max: u64) -> Self {
        Self {
            bitrate: AtomicU64::new(initial.clamp(min, max)),
            remb_cap: AtomicU64::new(max),
            min,
            max,
        }
    }

    /// Apply a receiver report's `fraction_lost` (loss scaled to 0..=255)
    pub fn on_loss_report(&self, fraction_lost: u8) {
        let loss = fraction_lost as f64 / 256.0;
        let current = self.bitrate.load(Ordering::Relaxed) as f64;
        let next = if loss > HIGH_LOSS {
            current * (1.0 - 0.5 * loss)
        } else if loss < LOW_LOSS {
            current * INCREASE_FACTOR
        } else {
            current
        };
        self.store(next as u64);
    }

    /// Apply a receiver-estimated maximum bitrate
    pub fn on_remb(&self, bitrate: u64) {
        self.remb_cap
            .store(bitrate.clamp(self.min, self.max), Ordering::Relaxed);
        let current = self.bitrate.load(Ordering::Relaxed);
        self.store(current);
    }

    fn store(&self, value: u64) {
        let cap = self.remb_cap.load(Ordering::Relaxed);
        let clamped = value.min(cap).clamp(self.min, self.max);
        self.bitrate.store(clamped, Ordering::Relaxed);
    }
}

impl BandwidthEstimator for RtcpFeedbackEstimator {
    fn target_bitrate(&self) -> u64 {
        self.bitrate.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct PoolInner {
    pending: VecDeque<Arc<dyn BandwidthEstimator>>,
    assigned: HashMap<Ipv4Addr, Arc<dyn BandwidthEstimator>>,
}

/// Pending and assigned estimators, behind their own lock
#[derive(Default)]
pub struct EstimatorPool {
    inner: Mutex<PoolInner>,
}

impl EstimatorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an estimator produced by a new session
    pub fn enqueue(&self, estimator: Arc<dyn BandwidthEstimator>) {
        self.inner.lock().pending.push_back(estimator);
    }

    /// Give the oldest pending estimator to `peer`. Returns `false` when the
    /// queue is empty.
    pub fn assign(&self, peer: Ipv4Addr) -> bool {
        let mut inner = self.inner.lock();
        match inner.pending.pop_front() {
            Some(estimator) => {
                inner.assigned.insert(peer, estimator);
                debug!(%peer, "Assigned bandwidth estimator");
                true
            }
            None => false,
        }
    }

    /// Drop the estimator assigned to `peer`
    pub fn release(&self, peer: Ipv4Addr) {
        self.inner.lock().assigned.remove(&peer);
    }

    /// Current target bitrate of every assigned estimator
    pub fn poll(&self) -> BTreeMap<Ipv4Addr, u64> {
        self.inner
            .lock()
            .assigned
            .iter()
            .map(|(peer, estimator)| (*peer, estimator.target_bitrate()))
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
