//! WebRTC adapters over webrtc-rs
//!
//! Concrete [`crate::peer::PeerConnector`] and media track plumbing used by
//! the `send` and `receive` commands.

pub mod media_track;
pub mod peer_connection;

pub use media_track::{new_outgoing_video_track, spawn_h264_feeder, RemoteTrackSource};
pub use peer_connection::{RtcPeer, RtcPeerFactory};
