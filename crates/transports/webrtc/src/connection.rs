//! One peer connection and its per-connection state
//!
//! All mutable state sits behind one lock that is never held across an
//! `.await`; callers clone the channel or sender they need and release it
//! before doing I/O.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::allocation::{allocate, ActiveStreams, Allocation, AUDIO_TIERS};
use crate::control::{PingTracker, PongOutcome};
use crate::events::ConnectionStatus;
use crate::identity::NodeIdentity;
use crate::media::TrackId;
use crate::rtc::{
    ControlChannel, IceCandidate, LinkState, MediaSender, RtcSession, SessionKey,
    DATA_CHANNEL_LABEL, PING_CHANNEL_LABEL,
};
use crate::signaling::Role;

/// Connection lifecycle. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Negotiating,
    Established,
    Closed,
}

/// Where an outbound chunk goes for one connection
pub enum MediaRoute {
    Send(Arc<dyn MediaSender>),
    /// Peer has not joined the shared session
    NotInSession,
    /// Transport is not connected
    NotConnected,
    /// Tracks not added yet
    NoSender,
    /// Audio chunk encoded for a different tier than this link is allocated
    BitrateMismatch { tagged: u32, allocated: u32 },
}

impl MediaRoute {
    pub fn is_send(&self) -> bool {
        matches!(self, MediaRoute::Send(_))
    }
}

struct ConnectionState {
    phase: Phase,
    link: LinkState,
    data_channel: Option<Arc<dyn ControlChannel>>,
    ping_channel: Option<Arc<dyn ControlChannel>>,
    pending_candidates: Vec<IceCandidate>,
    ping: PingTracker,
    in_session: bool,
    target_bitrate: Option<u64>,
    allocation: Allocation,
    senders: HashMap<TrackId, Arc<dyn MediaSender>>,
    /// Identity of the peer process this connection was made with
    peer_identity: Option<NodeIdentity>,
}

/// A connection to one peer
pub struct Connection {
    key: SessionKey,
    role: Role,
    session: Arc<dyn RtcSession>,
    created_at: DateTime<Utc>,
    created: Instant,
    gathered: Notify,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub fn new(key: SessionKey, role: Role, session: Arc<dyn RtcSession>) -> Self {
        Self {
            key,
            role,
            session,
            created_at: Utc::now(),
            created: Instant::now(),
            gathered: Notify::new(),
            state: Mutex::new(ConnectionState {
                phase: Phase::Negotiating,
                link: LinkState::New,
                data_channel: None,
                ping_channel: None,
                pending_candidates: Vec::new(),
                ping: PingTracker::default(),
                in_session: false,
                target_bitrate: None,
                allocation: Allocation::new(),
                senders: HashMap::new(),
                peer_identity: None,
            }),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn peer(&self) -> Ipv4Addr {
        self.key.peer
    }

    pub fn id(&self) -> u64 {
        self.key.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session(&self) -> &Arc<dyn RtcSession> {
        &self.session
    }

    /// Time since the connection was created
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == Phase::Closed
    }

    /// `Negotiating` to `Established`. Returns `false` from any other phase.
    pub fn mark_established(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase != Phase::Negotiating {
            return false;
        }
        state.phase = Phase::Established;
        true
    }

    /// Move to `Closed`. Returns `false` if already closed.
    pub fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        if state.phase == Phase::Closed {
            return false;
        }
        state.phase = Phase::Closed;
        true
    }

    /// Record which peer process this connection belongs to. The first call
    /// binds; later calls return `false` if `identity` is a different process.
    pub fn bind_identity(&self, identity: &NodeIdentity) -> bool {
        let mut state = self.state.lock();
        match &state.peer_identity {
            Some(bound) => bound.same_process(identity),
            None => {
                state.peer_identity = Some(identity.clone());
                true
            }
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.state.lock().link
    }

    pub fn set_link_state(&self, link: LinkState) {
        self.state.lock().link = link;
    }

    /// Store a data channel under its label. Returns `false` for unknown labels.
    pub fn attach_channel(&self, channel: Arc<dyn ControlChannel>) -> bool {
        let mut state = self.state.lock();
        match channel.label() {
            DATA_CHANNEL_LABEL => state.data_channel = Some(channel),
            PING_CHANNEL_LABEL => state.ping_channel = Some(channel),
            _ => return false,
        }
        true
    }

    /// Application data channel, if open
    pub fn data_channel(&self) -> Option<Arc<dyn ControlChannel>> {
        self.state
            .lock()
            .data_channel
            .clone()
            .filter(|c| c.is_open())
    }

    /// Ping channel, if open
    pub fn ping_channel(&self) -> Option<Arc<dyn ControlChannel>> {
        self.state
            .lock()
            .ping_channel
            .clone()
            .filter(|c| c.is_open())
    }

    pub fn buffer_candidate(&self, candidate: IceCandidate) {
        self.state.lock().pending_candidates.push(candidate);
    }

    pub fn take_candidates(&self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.state.lock().pending_candidates)
    }

    /// Signal that local ICE gathering finished
    pub fn notify_gathered(&self) {
        self.gathered.notify_one();
    }

    /// Wait for [`Self::notify_gathered`]; `false` on timeout
    pub async fn wait_gathered(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.gathered.notified())
            .await
            .is_ok()
    }

    pub fn record_ping(&self, at: Instant) {
        self.state.lock().ping.record_ping(at);
    }

    pub fn record_pong(&self, at: Instant) -> PongOutcome {
        self.state.lock().ping.record_pong(at)
    }

    pub fn latency(&self) -> Option<Duration> {
        self.state.lock().ping.latency()
    }

    pub fn in_session(&self) -> bool {
        self.state.lock().in_session
    }

    pub fn set_in_session(&self, in_session: bool) {
        self.state.lock().in_session = in_session;
    }

    pub fn set_senders(&self, senders: HashMap<TrackId, Arc<dyn MediaSender>>) {
        self.state.lock().senders = senders;
    }

    /// Record a new link estimate and recompute the allocation
    pub fn update_bandwidth(&self, target_bitrate: u64, active: ActiveStreams) {
        let mut state = self.state.lock();
        state.target_bitrate = Some(target_bitrate);
        state.allocation = allocate(target_bitrate, active);
    }

    /// Recompute the allocation for a new set of active streams using the
    /// last known estimate
    pub fn refresh_allocation(&self, active: ActiveStreams) {
        let mut state = self.state.lock();
        if let Some(total) = state.target_bitrate {
            state.allocation = allocate(total, active);
        }
    }

    pub fn allocation(&self) -> Allocation {
        self.state.lock().allocation.clone()
    }

    /// Decide whether a chunk for `track` tagged `bitrate` is sent on this
    /// connection.
    ///
    /// Audio chunks must carry exactly the tier allocated to this link; before
    /// the first estimate the lowest audio tier is expected.
    pub fn media_route(&self, track: TrackId, bitrate: Option<u32>) -> MediaRoute {
        let state = self.state.lock();
        if !state.in_session {
            return MediaRoute::NotInSession;
        }
        if state.link != LinkState::Connected {
            return MediaRoute::NotConnected;
        }
        let Some(sender) = state.senders.get(&track) else {
            return MediaRoute::NoSender;
        };
        if let (true, Some(tagged)) = (track.is_audio(), bitrate) {
            let allocated = state
                .allocation
                .get(&track)
                .copied()
                .unwrap_or(AUDIO_TIERS[0]);
            if tagged != allocated {
                return MediaRoute::BitrateMismatch { tagged, allocated };
            }
        }
        MediaRoute::Send(Arc::clone(sender))
    }

    /// Row for the `rtc_status` event
    pub fn status(&self) -> ConnectionStatus {
        let state = self.state.lock();
        ConnectionStatus {
            peer_ip: self.peer(),
            role: self.role,
            state: self.session.state(),
            created_at: self.created_at,
            last_ping_time: state.ping.last_ping_at(),
            latency: state.ping.latency().map(|d| d.as_millis() as u64),
            has_data_channel: state.data_channel.is_some(),
            data_channel_ready: state
                .data_channel
                .as_ref()
                .map(|c| c.is_open())
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::mock::{MockChannel, MockEngine, MockSender};
    use crate::rtc::RtcEngine;
    use tokio::sync::mpsc;

    async fn connection(role: Role) -> Connection {
        let engine = MockEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let key = SessionKey {
            peer: Ipv4Addr::new(100, 64, 0, 2),
            id: 1,
        };
        let session = engine.create_session(key, tx).await.unwrap();
        Connection::new(key, role, session)
    }

    fn connected_with_sender(conn: &Connection) -> Arc<MockSender> {
        let sender = Arc::new(MockSender::default());
        let mut senders: HashMap<TrackId, Arc<dyn MediaSender>> = HashMap::new();
        senders.insert(TrackId::Microphone, sender.clone());
        senders.insert(TrackId::ScreenVideo, sender.clone());
        conn.set_senders(senders);
        conn.set_link_state(LinkState::Connected);
        conn.set_in_session(true);
        sender
    }

    #[tokio::test]
    async fn test_phase_moves_forward_only() {
        let conn = connection(Role::Offer).await;
        assert_eq!(conn.phase(), Phase::Negotiating);

        assert!(conn.mark_established());
        assert!(!conn.mark_established());
        assert!(conn.mark_closed());
        assert!(!conn.mark_established());
        assert!(!conn.mark_closed());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_identity_binds_once() {
        let conn = connection(Role::Offer).await;
        let first = NodeIdentity {
            hostname: "peer".to_string(),
            start_time: 1_000,
            random_id: 3,
            virtual_address: conn.peer(),
        };
        let restarted = NodeIdentity {
            start_time: 1_200,
            ..first.clone()
        };

        assert!(conn.bind_identity(&first));
        assert!(conn.bind_identity(&first));
        assert!(!conn.bind_identity(&restarted));
        assert!(conn.bind_identity(&first));
    }

    #[tokio::test]
    async fn test_channels_attach_by_label() {
        let conn = connection(Role::Answer).await;
        let data = MockChannel::new(DATA_CHANNEL_LABEL);
        assert!(conn.attach_channel(data.clone()));
        assert!(!conn.attach_channel(MockChannel::new("other")));

        // attached but not open yet
        assert!(conn.data_channel().is_none());
        data.set_open(true);
        assert!(conn.data_channel().is_some());
        assert!(conn.ping_channel().is_none());
    }

    #[tokio::test]
    async fn test_gathered_permit_is_kept() {
        let conn = connection(Role::Offer).await;
        conn.notify_gathered();
        assert!(conn.wait_gathered(Duration::from_millis(10)).await);
        assert!(!conn.wait_gathered(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_media_route_requires_session_and_link() {
        let conn = connection(Role::Offer).await;
        assert!(matches!(
            conn.media_route(TrackId::ScreenVideo, None),
            MediaRoute::NotInSession
        ));

        conn.set_in_session(true);
        assert!(matches!(
            conn.media_route(TrackId::ScreenVideo, None),
            MediaRoute::NotConnected
        ));

        conn.set_link_state(LinkState::Connected);
        assert!(matches!(
            conn.media_route(TrackId::ScreenVideo, None),
            MediaRoute::NoSender
        ));

        connected_with_sender(&conn);
        assert!(conn.media_route(TrackId::ScreenVideo, None).is_send());
    }

    #[tokio::test]
    async fn test_audio_gate_matches_allocation_exactly() {
        let conn = connection(Role::Offer).await;
        connected_with_sender(&conn);

        // no estimate yet: lowest tier expected
        assert!(conn.media_route(TrackId::Microphone, Some(32_000)).is_send());
        assert!(!conn.media_route(TrackId::Microphone, Some(64_000)).is_send());

        let active = ActiveStreams {
            microphone: true,
            ..Default::default()
        };
        conn.update_bandwidth(100_000, active);
        assert!(conn.media_route(TrackId::Microphone, Some(64_000)).is_send());
        assert!(matches!(
            conn.media_route(TrackId::Microphone, Some(128_000)),
            MediaRoute::BitrateMismatch {
                tagged: 128_000,
                allocated: 64_000
            }
        ));
    }

    #[tokio::test]
    async fn test_refresh_uses_last_estimate() {
        let conn = connection(Role::Offer).await;
        conn.refresh_allocation(ActiveStreams {
            microphone: true,
            ..Default::default()
        });
        assert!(conn.allocation().is_empty());

        conn.update_bandwidth(2_000_000, ActiveStreams::default());
        assert!(conn.allocation().is_empty());

        conn.refresh_allocation(ActiveStreams {
            screen: true,
            ..Default::default()
        });
        assert_eq!(conn.allocation()[&TrackId::ScreenVideo], 1_000_000);
    }

    #[tokio::test]
    async fn test_status_row() {
        let conn = connection(Role::Answer).await;
        let data = MockChannel::new(DATA_CHANNEL_LABEL);
        conn.attach_channel(data);
        let sent = Instant::now();
        conn.record_ping(sent);
        conn.record_pong(sent + Duration::from_millis(25));

        let row = conn.status();
        assert_eq!(row.role, Role::Answer);
        assert_eq!(row.latency, Some(25));
        assert!(row.has_data_channel);
        assert!(!row.data_channel_ready);
        assert!(row.last_ping_time.is_some());
    }
}
