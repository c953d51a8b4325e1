//! Signaling delivery

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::SignalingMessage;
use crate::{Error, Result};

/// Delivers a signaling message to one peer
#[async_trait]
pub trait SignalingSender: Send + Sync {
    async fn send(&self, to: Ipv4Addr, message: &SignalingMessage) -> Result<()>;
}

/// Posts signaling messages to `http://{peer}:{port}/{endpoint}`
#[derive(Debug, Clone)]
pub struct HttpSignaler {
    client: reqwest::Client,
    port: u16,
}

impl HttpSignaler {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::SignalingError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, port })
    }

    fn url(&self, to: Ipv4Addr, message: &SignalingMessage) -> String {
        format!("http://{}:{}/{}", to, self.port, message.endpoint())
    }
}

#[async_trait]
impl SignalingSender for HttpSignaler {
    async fn send(&self, to: Ipv4Addr, message: &SignalingMessage) -> Result<()> {
        let url = self.url(to, message);
        debug!(peer = %to, "Sending {} to {}", message.role(), url);

        let response = self.client.post(&url).json(message).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SignalingError(format!(
                "{} returned {}: {}",
                url,
                status,
                body.trim()
            )));
        }
        Ok(())
    }
}
