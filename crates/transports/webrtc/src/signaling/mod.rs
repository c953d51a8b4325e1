//! Point-to-point signaling between mesh nodes
//!
//! Offers and answers travel as one HTTP POST each, carrying the session
//! description together with every local ICE candidate gathered so far:
//!
//! - [`message`]: the tagged offer/answer message and its JSON shape
//! - [`client`]: delivery to a peer's signaling server
//! - [`server`]: the axum router that receives them

pub mod client;
pub mod message;
pub mod server;

pub use client::{HttpSignaler, SignalingSender};
pub use message::{Role, SignalingMessage};
pub use server::router;
