//! Local application bridge
//!
//! Routes what the local application sends into the mesh: control JSON from
//! the `/msg` socket and encoded media frames from the `/` socket. Traffic in
//! the other direction leaves through [`crate::events::EventSender`] and the
//! orchestrator's media outlet.

use std::net::Ipv4Addr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::connection::MediaRoute;
use crate::control::{direct_message_targets, BridgeCommand};
use crate::media::OutboundChunk;
use crate::orchestrator::MeshOrchestrator;
use crate::Result;

/// Handles input from the local application
pub struct LocalBridge {
    orchestrator: Arc<MeshOrchestrator>,
}

impl LocalBridge {
    pub fn new(orchestrator: Arc<MeshOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Dispatch one control message. Returns how many peers it reached.
    pub async fn handle_control(&self, text: &str) -> Result<usize> {
        let command = BridgeCommand::parse(text)?;
        let delivered = match command {
            BridgeCommand::Relay { target } => {
                let targets: Option<Vec<Ipv4Addr>> = target.map(|addr| vec![addr]);
                self.orchestrator
                    .send_to_peers(text, targets.as_deref())
                    .await
            }
            BridgeCommand::MirrorLocalState { user_state } => {
                info!(
                    in_chat = user_state.is_in_chat,
                    sharing_screen = user_state.is_sharing_screen,
                    sharing_audio = user_state.is_sharing_audio,
                    "Local state updated"
                );
                self.orchestrator.publish_local_state(user_state).await
            }
            BridgeCommand::DirectMessage { target_peers } => {
                let targets = direct_message_targets(&target_peers);
                self.orchestrator.send_to_peers(text, targets.as_deref()).await
            }
            BridgeCommand::UserState => self.orchestrator.send_to_peers(text, None).await,
            BridgeCommand::GetStatus => {
                self.orchestrator.status_round().await;
                0
            }
        };
        debug!(delivered, "Control message dispatched");
        Ok(delivered)
    }

    /// Write one outbound media frame to every connection that should get it.
    /// Returns how many connections accepted the sample.
    pub async fn forward_local_frame(&self, frame: Bytes) -> Result<usize> {
        let chunk = OutboundChunk::decode(frame)?;
        let mut written = 0;

        for conn in self.orchestrator.connections().await {
            match conn.media_route(chunk.track, chunk.bitrate) {
                MediaRoute::Send(sender) => {
                    match sender.write_sample(chunk.payload.clone(), chunk.duration).await {
                        Ok(()) => written += 1,
                        Err(e) => debug!(peer = %conn.peer(), "Sample write failed: {}", e),
                    }
                }
                MediaRoute::BitrateMismatch { tagged, allocated } => {
                    debug!(
                        peer = %conn.peer(),
                        track = %chunk.track,
                        tagged,
                        allocated,
                        "Dropping chunk encoded for another tier"
                    );
                }
                MediaRoute::NotInSession | MediaRoute::NotConnected | MediaRoute::NoSender => {}
            }
        }
        Ok(written)
    }
}
