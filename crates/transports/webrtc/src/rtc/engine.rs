//! webrtc-rs backed transport engine
//!
//! All sessions share one API instance whose ICE agent is restricted to UDP4
//! and multiplexed over a single socket bound to the overlay address, so media
//! never leaves the overlay interface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtcp::receiver_report::ReceiverReport;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::channel::WebRtcControlChannel;
use super::{
    ControlChannel, IceCandidate, LinkState, MediaSender, RemoteTrack, RtcEngine, RtcSession,
    RtpChunk, SdpKind, SessionDescription, SessionKey, TransportEvent, TransportEventSender,
};
use crate::bandwidth::{EstimatorPool, RtcpFeedbackEstimator};
use crate::config::MeshConfig;
use crate::media::TrackId;
use crate::{Error, Result};

/// Production transport engine
pub struct WebRtcEngine {
    api: API,
    estimators: Arc<EstimatorPool>,
    initial_bitrate: u64,
    min_bitrate: u64,
    max_bitrate: u64,
}

impl WebRtcEngine {
    /// Build the engine around a UDP socket already bound to the overlay address
    pub fn new(socket: UdpSocket, estimators: Arc<EstimatorPool>, config: &MeshConfig) -> Result<Self> {
        let local = socket.local_addr()?;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_network_types(vec![NetworkType::Udp4]);
        let udp_mux = UDPMuxDefault::new(UDPMuxParams::new(socket));
        setting_engine.set_udp_network(UDPNetwork::Muxed(udp_mux));

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        info!(%local, "WebRTC engine ready (UDP4, single-port ICE mux)");

        Ok(Self {
            api,
            estimators,
            initial_bitrate: config.initial_bitrate,
            min_bitrate: config.min_bitrate,
            max_bitrate: config.max_bitrate,
        })
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn create_session(
        &self,
        key: SessionKey,
        events: TransportEventSender,
    ) -> Result<Arc<dyn RtcSession>> {
        let pc = self
            .api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create peer connection: {}", e)))?;
        let pc = Arc::new(pc);

        let estimator = Arc::new(RtcpFeedbackEstimator::new(
            self.initial_bitrate,
            self.min_bitrate,
            self.max_bitrate,
        ));
        self.estimators.enqueue(estimator.clone());

        let session = WebRtcSession {
            key,
            pc,
            events,
            estimator,
        };
        session.install_handlers();
        debug!(%key, "Created peer connection");
        Ok(Arc::new(session))
    }
}

struct WebRtcSession {
    key: SessionKey,
    pc: Arc<RTCPeerConnection>,
    events: TransportEventSender,
    estimator: Arc<RtcpFeedbackEstimator>,
}

impl WebRtcSession {
    fn install_handlers(&self) {
        let key = self.key;

        let tx = self.events.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let event = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => TransportEvent::IceCandidate {
                            key,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            },
                        },
                        Err(e) => {
                            warn!(%key, "Failed to convert ICE candidate: {}", e);
                            return;
                        }
                    },
                    // ICE gathering complete (empty candidate signals end)
                    None => TransportEvent::GatheringComplete { key },
                };
                let _ = tx.send(event);
            })
        }));

        let tx = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    let state = link_state(state);
                    debug!(%key, %state, "Peer connection state changed");
                    let _ = tx.send(TransportEvent::StateChanged { key, state });
                })
            }));

        let tx = self.events.clone();
        self.pc.on_data_channel(Box::new(move |dc| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!(%key, "Remote opened data channel '{}'", dc.label());
                let channel: Arc<dyn ControlChannel> =
                    WebRtcControlChannel::attach(dc, key, tx.clone());
                let _ = tx.send(TransportEvent::DataChannel { key, channel });
            })
        }));

        let tx = self.events.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let id = track.id();
                info!(%key, "Remote track added: id={} kind={}", id, track.kind());
                let track: Arc<dyn RemoteTrack> = Arc::new(WebRtcRemoteTrack { id, track });
                let _ = tx.send(TransportEvent::RemoteTrack { key, track });
            })
        }));
    }

    /// Feed RTCP from one sender into the session's estimator until the
    /// sender stops
    fn spawn_rtcp_reader(&self, sender: Arc<webrtc::rtp_transceiver::rtp_sender::RTCRtpSender>) {
        let estimator = Arc::clone(&self.estimator);
        tokio::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                for packet in &packets {
                    let any = packet.as_any();
                    if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
                        for report in &rr.reports {
                            estimator.on_loss_report(report.fraction_lost);
                        }
                    } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
                        estimator.on_remb(remb.bitrate as u64);
                    }
                }
            }
        });
    }
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|e| Error::WebRtcError(format!("Invalid session description: {}", e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(Error::WebRtcError(format!(
            "Unexpected session description type: {}",
            other
        ))),
    }
}

#[async_trait]
impl RtcSession for WebRtcSession {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn ControlChannel>> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to create data channel: {}", e)))?;
        Ok(WebRtcControlChannel::attach(dc, self.key, self.events.clone()))
    }

    async fn add_local_tracks(&self) -> Result<HashMap<TrackId, Arc<dyn MediaSender>>> {
        let mut senders: HashMap<TrackId, Arc<dyn MediaSender>> = HashMap::new();
        for track_id in TrackId::ALL {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: track_id.codec().mime_type().to_string(),
                    ..Default::default()
                },
                track_id.track_label().to_string(),
                track_id.stream_id().to_string(),
            ));

            let rtp_sender = self
                .pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::MediaError(format!("Failed to add {} track: {}", track_id, e)))?;
            self.spawn_rtcp_reader(rtp_sender);

            senders.insert(track_id, Arc::new(SampleSender { track }));
        }
        Ok(senders)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    fn state(&self) -> LinkState {
        link_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

struct SampleSender {
    track: Arc<TrackLocalStaticSample>,
}

#[async_trait]
impl MediaSender for SampleSender {
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::MediaError(format!("Failed to write sample: {}", e)))
    }
}

struct WebRtcRemoteTrack {
    id: String,
    track: Arc<TrackRemote>,
}

#[async_trait]
impl RemoteTrack for WebRtcRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_rtp(&self) -> Result<RtpChunk> {
        let (packet, _) = self
            .track
            .read_rtp()
            .await
            .map_err(|e| Error::MediaError(format!("RTP read failed: {}", e)))?;
        Ok(RtpChunk {
            timestamp: packet.header.timestamp,
            payload: packet.payload,
        })
    }
}
