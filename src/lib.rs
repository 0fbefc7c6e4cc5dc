//! apelios-core - one-to-many WebRTC video streaming
//!
//! A signaling relay pairing one sender with any number of receivers, a
//! sender-side session manager and a receiver-side frame ingestion pump.

pub mod config;
pub mod media;
pub mod peer;
pub mod receiver;
pub mod rtc;
pub mod sender;
pub mod session;
pub mod signaling;
pub mod watchdog;

// Re-exports
pub use config::Config;
pub use media::{ErrorBudget, FrameIngestionPump, FrameQueue, PumpReport};
pub use peer::{ConnectionState, PeerCapability, PeerConnector};
pub use session::{SessionError, SessionManager, SessionState};
pub use signaling::{Relay, Role, SignalingClient, SignalingError, SignalingMessage};
pub use watchdog::{Watchdog, WatchdogError};
