//! In-memory transport and signaling doubles
//!
//! Lets the orchestrator, bridge and control protocols run without sockets.
//! Sessions record everything applied to them and expose helpers that inject
//! transport callbacks the way a real engine would deliver them.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ControlChannel, IceCandidate, LinkState, MediaSender, RemoteTrack, RtcEngine, RtcSession,
    RtpChunk, SessionDescription, SessionKey, TransportEvent, TransportEventSender,
};
use crate::bandwidth::{BandwidthEstimator, EstimatorPool};
use crate::media::TrackId;
use crate::signaling::{SignalingMessage, SignalingSender};
use crate::{Error, Result};

// ============================================================================
// Engine
// ============================================================================

/// Engine producing [`MockSession`]s
pub struct MockEngine {
    sessions: Mutex<Vec<Arc<MockSession>>>,
    estimators: Option<Arc<EstimatorPool>>,
    initial_bitrate: u64,
    auto_gather: AtomicBool,
    fail_create: AtomicBool,
}

impl MockEngine {
    /// Engine whose sessions gather one host candidate as soon as a local
    /// description is applied
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None, 0))
    }

    /// Engine that also queues one fixed-rate estimator per session
    pub fn with_estimators(pool: Arc<EstimatorPool>, initial_bitrate: u64) -> Arc<Self> {
        Arc::new(Self::build(Some(pool), initial_bitrate))
    }

    fn build(estimators: Option<Arc<EstimatorPool>>, initial_bitrate: u64) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            estimators,
            initial_bitrate,
            auto_gather: AtomicBool::new(true),
            fail_create: AtomicBool::new(false),
        }
    }

    /// When disabled, sessions never report gathering complete
    pub fn set_auto_gather(&self, enabled: bool) {
        self.auto_gather.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Every session created so far, oldest first
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }

    /// Most recent session created for `peer`
    pub fn session_for(&self, peer: Ipv4Addr) -> Option<Arc<MockSession>> {
        self.sessions
            .lock()
            .iter()
            .rev()
            .find(|s| s.key.peer == peer)
            .cloned()
    }
}

#[async_trait]
impl RtcEngine for MockEngine {
    async fn create_session(
        &self,
        key: SessionKey,
        events: TransportEventSender,
    ) -> Result<Arc<dyn RtcSession>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::WebRtcError("mock session creation failed".to_string()));
        }

        let estimator = Arc::new(MockEstimator::new(self.initial_bitrate));
        if let Some(pool) = &self.estimators {
            pool.enqueue(estimator.clone());
        }

        let session = Arc::new(MockSession {
            key,
            events,
            estimator,
            auto_gather: self.auto_gather.load(Ordering::SeqCst),
            channels: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            state: Mutex::new(LinkState::New),
            closed: AtomicBool::new(false),
        });
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Estimator whose value tests set directly
#[derive(Debug)]
pub struct MockEstimator {
    bitrate: AtomicU64,
}

impl MockEstimator {
    pub fn new(bitrate: u64) -> Self {
        Self {
            bitrate: AtomicU64::new(bitrate),
        }
    }

    pub fn set(&self, bitrate: u64) {
        self.bitrate.store(bitrate, Ordering::SeqCst);
    }
}

impl BandwidthEstimator for MockEstimator {
    fn target_bitrate(&self) -> u64 {
        self.bitrate.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Session
// ============================================================================

/// Recorded peer connection
pub struct MockSession {
    pub key: SessionKey,
    events: TransportEventSender,
    estimator: Arc<MockEstimator>,
    auto_gather: bool,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    senders: Mutex<HashMap<TrackId, Arc<MockSender>>>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    state: Mutex<LinkState>,
    closed: AtomicBool,
}

impl MockSession {
    /// Candidate reported when the local description is applied
    pub fn host_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:1 1 udp 2130706431 {} 9 typ host", self.key.peer),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    pub fn estimator(&self) -> Arc<MockEstimator> {
        Arc::clone(&self.estimator)
    }

    /// Locally created channel with this label
    pub fn channel(&self, label: &str) -> Option<Arc<MockChannel>> {
        self.channels
            .lock()
            .iter()
            .find(|c| c.label == label)
            .cloned()
    }

    pub fn sender(&self, track: TrackId) -> Option<Arc<MockSender>> {
        self.senders.lock().get(&track).cloned()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Inject any transport callback
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Change the connection state and report it
    pub fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
        self.emit(TransportEvent::StateChanged {
            key: self.key,
            state,
        });
    }

    /// Mark a local channel open and report it
    pub fn open_channel(&self, label: &str) {
        if let Some(channel) = self.channel(label) {
            channel.set_open(true);
        }
        self.emit(TransportEvent::ChannelOpen {
            key: self.key,
            label: label.to_string(),
        });
    }

    /// Simulate the remote side opening a channel; it starts open
    pub fn announce_remote_channel(&self, label: &str) -> Arc<MockChannel> {
        let channel = MockChannel::new(label);
        channel.set_open(true);
        self.emit(TransportEvent::DataChannel {
            key: self.key,
            channel: channel.clone(),
        });
        self.emit(TransportEvent::ChannelOpen {
            key: self.key,
            label: label.to_string(),
        });
        channel
    }

    /// Deliver a text message as if it arrived on `label`
    pub fn deliver(&self, label: &str, text: &str) {
        self.emit(TransportEvent::ChannelMessage {
            key: self.key,
            label: label.to_string(),
            text: text.to_string(),
        });
    }

    pub fn add_remote_track(&self, track: Arc<MockRemoteTrack>) {
        self.emit(TransportEvent::RemoteTrack {
            key: self.key,
            track,
        });
    }
}

#[async_trait]
impl RtcSession for MockSession {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn ControlChannel>> {
        let channel = MockChannel::new(label);
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn add_local_tracks(&self) -> Result<HashMap<TrackId, Arc<dyn MediaSender>>> {
        let mut out: HashMap<TrackId, Arc<dyn MediaSender>> = HashMap::new();
        let mut senders = self.senders.lock();
        for track in TrackId::ALL {
            let sender = Arc::new(MockSender::default());
            senders.insert(track, Arc::clone(&sender));
            out.insert(track, sender);
        }
        Ok(out)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("mock-offer {}", self.key)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.remote_description.lock().is_none() {
            return Err(Error::WebRtcError("no remote offer applied".to_string()));
        }
        Ok(SessionDescription::answer(format!("mock-answer {}", self.key)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        *self.local_description.lock() = Some(description);
        if self.auto_gather {
            self.emit(TransportEvent::IceCandidate {
                key: self.key,
                candidate: self.host_candidate(),
            });
            self.emit(TransportEvent::GatheringComplete { key: self.key });
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut remote = self.remote_description.lock();
        if remote.is_some() {
            return Err(Error::WebRtcError("remote description already applied".to_string()));
        }
        *remote = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    fn state(&self) -> LinkState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock() = LinkState::Closed;
        for channel in self.channels.lock().iter() {
            channel.set_open(false);
        }
        Ok(())
    }
}

// ============================================================================
// Channels, senders, tracks
// ============================================================================

/// Data channel that records sent text
pub struct MockChannel {
    label: String,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ControlChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::DataChannelError(format!(
                "Data channel '{}' is not open",
                self.label
            )));
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.set_open(false);
        Ok(())
    }
}

/// Media sender that records written samples
#[derive(Default)]
pub struct MockSender {
    samples: Mutex<Vec<(Bytes, Duration)>>,
}

impl MockSender {
    pub fn samples(&self) -> Vec<(Bytes, Duration)> {
        self.samples.lock().clone()
    }
}

#[async_trait]
impl MediaSender for MockSender {
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        self.samples.lock().push((data, duration));
        Ok(())
    }
}

/// Remote track fed from a channel; ends when the feeding side is dropped
pub struct MockRemoteTrack {
    id: String,
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<RtpChunk>>,
}

impl MockRemoteTrack {
    pub fn new(id: &str) -> (Arc<Self>, mpsc::UnboundedSender<RtpChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let track = Arc::new(Self {
            id: id.to_string(),
            packets: tokio::sync::Mutex::new(rx),
        });
        (track, tx)
    }
}

#[async_trait]
impl RemoteTrack for MockRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_rtp(&self) -> Result<RtpChunk> {
        self.packets
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::MediaError("track ended".to_string()))
    }
}

// ============================================================================
// Signaling
// ============================================================================

/// Signaler that records every message instead of sending it
#[derive(Default)]
pub struct RecordingSignaler {
    sent: Mutex<Vec<(Ipv4Addr, SignalingMessage)>>,
    fail: AtomicBool,
}

impl RecordingSignaler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(Ipv4Addr, SignalingMessage)> {
        self.sent.lock().clone()
    }

    /// Poll until at least `count` messages were recorded or `timeout` passes
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.sent.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sent.lock().len() >= count
    }
}

#[async_trait]
impl SignalingSender for RecordingSignaler {
    async fn send(&self, to: Ipv4Addr, message: &SignalingMessage) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::SignalingError(format!("mock delivery to {} failed", to)));
        }
        self.sent.lock().push((to, message.clone()));
        Ok(())
    }
}
