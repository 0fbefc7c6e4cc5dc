//! Signaling layer
//!
//! This module provides the session-description exchange between one sender
//! and any number of receivers:
//! - Wire codec for role-tagged JSON messages
//! - Relay registry and its WebSocket server
//! - Per-peer signaling client with a background receive pump

pub mod client;
pub mod codec;
pub mod relay;
pub mod server;

pub use client::{Inbound, SignalingChannel, SignalingClient};
pub use codec::{MessageKind, Role, Routing, SdpKind, SessionDescription, SignalingMessage};
pub use relay::{PeerHandle, Relay, RelayStats};
pub use server::{run_relay_server, RelayServerConfig};

use std::time::Duration;

/// Signaling errors
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// Signaling connection is gone
    #[error("signaling transport closed")]
    TransportClosed,
    /// Nothing arrived within the allowed window
    #[error("signaling timed out after {0:?}")]
    Timeout(Duration),
    /// Message of unexpected shape or kind
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A second peer tried to register as sender
    #[error("a sender is already registered")]
    DuplicateSender,
    /// Connection could not be established
    #[error("transport error: {0}")]
    Transport(String),
}
