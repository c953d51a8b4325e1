//! WebRTC data channel wrapper
//!
//! Wraps an `RTCDataChannel` as a [`ControlChannel`] and forwards its open,
//! message and close callbacks onto the session's transport event queue.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use super::{ControlChannel, SessionKey, TransportEvent, TransportEventSender};
use crate::{Error, Result};

/// Text data channel backed by webrtc-rs
pub struct WebRtcControlChannel {
    label: String,
    rtc_channel: Arc<RTCDataChannel>,
}

impl WebRtcControlChannel {
    /// Wrap a channel and install its handlers
    pub fn attach(
        rtc_channel: Arc<RTCDataChannel>,
        key: SessionKey,
        events: TransportEventSender,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            label: rtc_channel.label().to_string(),
            rtc_channel,
        });
        channel.setup_handlers(key, events);
        channel
    }

    fn setup_handlers(&self, key: SessionKey, events: TransportEventSender) {
        let label = self.label.clone();
        let tx = events.clone();
        self.rtc_channel.on_open(Box::new(move || {
            Box::pin(async move {
                debug!(peer = %key.peer, "Data channel '{}' opened", label);
                let _ = tx.send(TransportEvent::ChannelOpen { key, label });
            })
        }));

        let label = self.label.clone();
        let tx = events.clone();
        self.rtc_channel.on_message(Box::new(move |msg| {
            let label = label.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if !msg.is_string {
                    warn!(peer = %key.peer, "Ignoring binary message on '{}'", label);
                    return;
                }
                let text = String::from_utf8_lossy(&msg.data).into_owned();
                let _ = tx.send(TransportEvent::ChannelMessage { key, label, text });
            })
        }));

        let label = self.label.clone();
        let tx = events;
        self.rtc_channel.on_close(Box::new(move || {
            let label = label.clone();
            let tx = tx.clone();
            Box::pin(async move {
                debug!(peer = %key.peer, "Data channel '{}' closed", label);
                let _ = tx.send(TransportEvent::ChannelClosed { key, label });
            })
        }));

        let label = self.label.clone();
        self.rtc_channel.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                error!(peer = %key.peer, "Data channel '{}' error: {}", label, err);
            })
        }));
    }
}

#[async_trait]
impl ControlChannel for WebRtcControlChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.rtc_channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::DataChannelError(format!(
                "Data channel '{}' is not open (state: {})",
                self.label,
                self.rtc_channel.ready_state()
            )));
        }
        self.rtc_channel
            .send_text(text.to_string())
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send on '{}': {}", self.label, e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.rtc_channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close channel: {}", e)))
    }
}
