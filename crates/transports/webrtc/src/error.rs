//! Error types for the mesh transport

use std::net::Ipv4Addr;

use crate::signaling::Role;

/// Result type alias for mesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Mesh transport errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// WebRTC engine error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Signaling delivery error (HTTP request failed or was refused)
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Peer sent something the protocol does not allow
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A connection for this peer already exists
    #[error("Connection to {0} already exists")]
    DuplicateConnection(Ipv4Addr),

    /// No connection is tracked for this peer
    #[error("No connection for peer {0}")]
    ConnectionNotFound(Ipv4Addr),

    /// Answer received for a connection that did not send the offer
    #[error("Role mismatch for peer {peer}: connection was created as {actual}")]
    RoleMismatch { peer: Ipv4Addr, actual: Role },

    /// Media frame could not be decoded
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Media track or sample error
    #[error("Media error: {0}")]
    MediaError(String),

    /// Overlay network status could not be read
    #[error("Overlay error: {0}")]
    OverlayError(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::SignalingError(err.to_string())
    }
}
