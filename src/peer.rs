//! Peer-connection capability
//!
//! The session layer never talks to a WebRTC stack directly. It drives a
//! [`PeerCapability`] obtained from a [`PeerConnector`]; the concrete
//! implementation over webrtc-rs lives in [`crate::rtc`].

use crate::signaling::SessionDescription;
use crate::watchdog::ConnectionObserver;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Underlying connection state as reported by the peer capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// `failed` and `closed` never recover
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Peer capability errors
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer connection creation failed: {0}")]
    Creation(String),
    #[error("SDP error: {0}")]
    Sdp(String),
    #[error("media error: {0}")]
    Media(String),
    #[error("peer connection close failed: {0}")]
    Close(String),
}

/// One peer connection
#[async_trait]
pub trait PeerCapability: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a local description and return the description to signal,
    /// which may carry gathered candidates the input lacked.
    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, description: &SessionDescription)
        -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;

    /// Report every connection state change to `observer`
    fn observe(&self, observer: Arc<dyn ConnectionObserver>);
}

/// Factory for peer capabilities plus the way outgoing media is attached
#[async_trait]
pub trait PeerConnector: Send + Sync {
    type Peer: PeerCapability + 'static;
    /// Outgoing media shared read-only by every peer
    type Media: Send + Sync + 'static;

    async fn create_peer(&self) -> Result<Arc<Self::Peer>, PeerError>;

    async fn attach_media(&self, peer: &Self::Peer, media: &Arc<Self::Media>)
        -> Result<(), PeerError>;
}
