//! End-to-end signaling over a real relay on localhost

use apelios_core::peer::{ConnectionState, PeerCapability, PeerConnector, PeerError};
use apelios_core::session::{SessionManager, SessionState};
use apelios_core::signaling::server::serve;
use apelios_core::signaling::{
    Inbound, Relay, Role, Routing, SdpKind, SessionDescription, SignalingClient,
};
use apelios_core::watchdog::ConnectionObserver;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> (SocketAddr, Arc<Relay>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = Arc::new(Relay::new());
    tokio::spawn(serve(listener, relay.clone(), WAIT));
    (addr, relay)
}

async fn connect(addr: SocketAddr, role: Role) -> SignalingClient {
    SignalingClient::connect(&format!("ws://{}/signaling", addr), role)
        .await
        .unwrap()
}

async fn next(client: &SignalingClient) -> Inbound {
    client.receive_timeout(WAIT).await.expect("inbound message")
}

async fn wait_for_receivers(relay: &Relay, count: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while relay.stats().receivers != count {
        assert!(tokio::time::Instant::now() < deadline, "receivers never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
struct FakePeer {
    remote: Mutex<Option<String>>,
}

#[async_trait]
impl PeerCapability for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::offer("v=0 fake offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::answer("v=0 fake answer"))
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        Ok(description.clone())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError> {
        *self.remote.lock() = Some(description.sdp.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        Ok(())
    }

    fn observe(&self, observer: Arc<dyn ConnectionObserver>) {
        observer.on_state_change(ConnectionState::Connecting);
    }
}

struct FakeConnector;

#[async_trait]
impl PeerConnector for FakeConnector {
    type Peer = FakePeer;
    type Media = ();

    async fn create_peer(&self) -> Result<Arc<FakePeer>, PeerError> {
        Ok(Arc::new(FakePeer::default()))
    }

    async fn attach_media(&self, _peer: &FakePeer, _media: &Arc<()>) -> Result<(), PeerError> {
        Ok(())
    }
}

/// Receiver side of one handshake: take the offer, answer it with the echoed session id
async fn answer_offer(receiver: &SignalingClient, sdp: &str) -> u64 {
    match next(receiver).await {
        Inbound::Description {
            description,
            routing,
        } => {
            assert_eq!(description.kind, SdpKind::Offer);
            let session_id = routing.session_id.expect("offer carries a session id");
            receiver
                .send_tagged(&SessionDescription::answer(sdp), Routing::session(session_id))
                .await
                .unwrap();
            session_id
        }
        other => panic!("expected offer, got {:?}", other),
    }
}

#[tokio::test]
async fn single_receiver_handshake() {
    let (addr, _relay) = start_relay().await;
    let manager = SessionManager::new(FakeConnector, Arc::new(()), 4);

    let sender = connect(addr, Role::Sender).await;
    let receiver = connect(addr, Role::Receiver).await;

    let request = next(&sender).await;
    assert!(matches!(request, Inbound::RequestOffer { peer_id: Some(_) }));
    assert!(manager.handle_inbound(&sender, request).await);
    assert_eq!(manager.state_of(1), Some(SessionState::OfferSent));

    assert_eq!(answer_offer(&receiver, "v=0 answer").await, 1);

    let answer = next(&sender).await;
    match &answer {
        Inbound::Description { routing, .. } => {
            assert_eq!(routing.session_id, Some(1));
            assert!(routing.peer_id.is_some());
        }
        other => panic!("expected answer, got {:?}", other),
    }
    assert!(manager.handle_inbound(&sender, answer).await);
    assert_eq!(manager.state_of(1), Some(SessionState::Active));

    receiver.close().await;
    sender.close().await;
}

#[tokio::test]
async fn concurrent_receivers_get_their_own_sessions() {
    let (addr, relay) = start_relay().await;
    let manager = SessionManager::new(FakeConnector, Arc::new(()), 4);
    let sender = connect(addr, Role::Sender).await;

    let first = connect(addr, Role::Receiver).await;
    let request = next(&sender).await;
    manager.handle_inbound(&sender, request).await;

    let second = connect(addr, Role::Receiver).await;
    let request = next(&sender).await;
    manager.handle_inbound(&sender, request).await;
    wait_for_receivers(&relay, 2).await;

    // Offers are targeted, so each receiver sees exactly one.
    assert_eq!(answer_offer(&second, "second").await, 2);
    assert_eq!(answer_offer(&first, "first").await, 1);
    assert!(matches!(
        second.receive_timeout(Duration::from_millis(200)).await,
        Err(apelios_core::SignalingError::Timeout(_))
    ));

    for _ in 0..2 {
        let answer = next(&sender).await;
        manager.handle_inbound(&sender, answer).await;
    }
    assert_eq!(manager.state_of(1), Some(SessionState::Active));
    assert_eq!(manager.state_of(2), Some(SessionState::Active));
    assert_eq!(manager.session_count(), 2);

    manager.close_all().await;
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test]
async fn late_sender_is_asked_for_waiting_receivers() {
    let (addr, relay) = start_relay().await;
    let _first = connect(addr, Role::Receiver).await;
    let _second = connect(addr, Role::Receiver).await;
    wait_for_receivers(&relay, 2).await;

    let sender = connect(addr, Role::Sender).await;
    let mut peers = Vec::new();
    for _ in 0..2 {
        match next(&sender).await {
            Inbound::RequestOffer { peer_id: Some(id) } => peers.push(id),
            other => panic!("expected offer request, got {:?}", other),
        }
    }
    peers.sort_unstable();
    peers.dedup();
    assert_eq!(peers.len(), 2);
}

#[tokio::test]
async fn second_sender_is_disconnected() {
    let (addr, relay) = start_relay().await;
    let _sender = connect(addr, Role::Sender).await;
    let deadline = tokio::time::Instant::now() + WAIT;
    while !relay.stats().sender_connected {
        assert!(tokio::time::Instant::now() < deadline, "sender never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let intruder = connect(addr, Role::Sender).await;

    assert_eq!(next(&intruder).await, Inbound::EndOfStream);
    assert!(relay.stats().sender_connected);
}

#[tokio::test]
async fn closed_client_stays_closed() {
    let (addr, relay) = start_relay().await;
    let sender = connect(addr, Role::Sender).await;
    let _receiver = connect(addr, Role::Receiver).await;
    wait_for_receivers(&relay, 1).await;
    // Give the relay's offer request time to land in the sender's queue.
    tokio::time::sleep(Duration::from_millis(100)).await;

    sender.close().await;
    assert!(sender.is_closed());
    sender.close().await;
    assert!(sender.is_closed());

    assert!(matches!(
        sender.send(&SessionDescription::offer("v=0")).await,
        Err(apelios_core::SignalingError::TransportClosed)
    ));
    assert_eq!(next(&sender).await, Inbound::EndOfStream);
    assert_eq!(sender.receive().await, Inbound::EndOfStream);
}

#[tokio::test]
async fn health_reports_registry() {
    let (addr, relay) = start_relay().await;
    let _sender = connect(addr, Role::Sender).await;
    let _receiver = connect(addr, Role::Receiver).await;
    wait_for_receivers(&relay, 1).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    tokio::time::timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"sender_connected\":true"));
    assert!(response.contains("\"receivers\":1"));
}
