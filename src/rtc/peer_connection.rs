//! WebRTC PeerConnection management
//!
//! [`RtcPeerFactory`] builds webrtc-rs peer connections with an H.264 video
//! codec; [`RtcPeer`] exposes one of them through [`PeerCapability`].

use crate::config::WebRTCConfig;
use crate::peer::{ConnectionState, PeerCapability, PeerConnector, PeerError};
use crate::signaling::{SdpKind, SessionDescription};
use crate::watchdog::ConnectionObserver;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

pub(crate) const H264_FMTP: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// H.264 capability shared by the codec registration and outgoing tracks
pub(crate) fn h264_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: H264_FMTP.to_string(),
        rtcp_feedback: vec![],
    }
}

/// Builds peer connections from the WebRTC configuration
pub struct RtcPeerFactory {
    config: WebRTCConfig,
}

impl RtcPeerFactory {
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    /// Create a new peer connection with the configured settings
    pub async fn create_peer_connection(&self) -> Result<RtcPeer, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: h264_capability(),
                    payload_type: 96,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| PeerError::Creation(format!("Failed to register H264: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PeerError::Creation(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = self
            .config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| PeerError::Creation(format!("Failed to create peer connection: {}", e)))?;

        Ok(RtcPeer::new(Arc::new(pc), self.config.gather_timeout()))
    }
}

#[async_trait]
impl PeerConnector for RtcPeerFactory {
    type Peer = RtcPeer;
    type Media = TrackLocalStaticSample;

    async fn create_peer(&self) -> Result<Arc<RtcPeer>, PeerError> {
        self.create_peer_connection().await.map(Arc::new)
    }

    async fn attach_media(
        &self,
        peer: &RtcPeer,
        media: &Arc<TrackLocalStaticSample>,
    ) -> Result<(), PeerError> {
        let track: Arc<dyn TrackLocal + Send + Sync> = media.clone();
        let rtp_sender = peer
            .pc
            .add_track(track)
            .await
            .map_err(|e| PeerError::Media(format!("Failed to add video track: {}", e)))?;

        // Drain RTCP so the interceptors keep running.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
            debug!("RTCP reader finished");
        });
        Ok(())
    }
}

/// One webrtc-rs peer connection
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    gather_timeout: Duration,
    remote_tracks: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<TrackRemote>>>,
}

impl RtcPeer {
    fn new(pc: Arc<RTCPeerConnection>, gather_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            if track.kind() == RTPCodecType::Video {
                debug!("Remote video track {} (ssrc {})", track.id(), track.ssrc());
                let _ = tx.send(track);
            }
            Box::pin(async {})
        }));

        Self {
            pc,
            gather_timeout,
            remote_tracks: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Wait for the next remote video track
    pub async fn next_video_track(&self, timeout: Duration) -> Option<Arc<TrackRemote>> {
        let mut tracks = self.remote_tracks.lock().await;
        tokio::time::timeout(timeout, tracks.recv()).await.ok().flatten()
    }
}

fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let sdp = description.sdp.clone();
    let converted = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    };
    converted.map_err(|e| PeerError::Sdp(format!("Invalid SDP {}: {}", description.kind.as_str(), e)))
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

#[async_trait]
impl PeerCapability for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Sdp(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Sdp(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    /// Candidates are not trickled, so the returned description waits for
    /// gathering (bounded by the configured timeout).
    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        let mut gather_complete = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|e| PeerError::Sdp(format!("Failed to set local description: {}", e)))?;

        if tokio::time::timeout(self.gather_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            warn!("ICE gathering incomplete after {:?}", self.gather_timeout);
        }

        let local = self.pc.local_description().await;
        Ok(local
            .map(|d| SessionDescription {
                kind: description.kind,
                sdp: d.sdp,
            })
            .unwrap_or_else(|| description.clone()))
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|e| PeerError::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::Close(e.to_string()))
    }

    fn observe(&self, observer: Arc<dyn ConnectionObserver>) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                observer.on_state_change(connection_state(state));
                Box::pin(async {})
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping() {
        assert_eq!(connection_state(RTCPeerConnectionState::Unspecified), ConnectionState::New);
        assert_eq!(connection_state(RTCPeerConnectionState::Failed), ConnectionState::Failed);
        assert!(connection_state(RTCPeerConnectionState::Closed).is_terminal());
    }

    #[test]
    fn rejects_unparsable_sdp() {
        let err = to_rtc(&SessionDescription::answer("not an sdp")).unwrap_err();
        assert!(matches!(err, PeerError::Sdp(_)));
    }

    #[tokio::test]
    async fn offer_contains_h264_after_attaching_track() {
        let factory = RtcPeerFactory::new(WebRTCConfig {
            gather_timeout_secs: 1.0,
            ..Default::default()
        });
        let peer = factory.create_peer().await.unwrap();
        let track = crate::rtc::new_outgoing_video_track();
        factory.attach_media(&peer, &track).await.unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("H264"));
        peer.close().await.unwrap();
    }
}
