//! Sender-side session lifecycle
//!
//! One [`StreamSession`] per offer request:
//! - `Idle -> OfferSent` when the offer has gone out
//! - `OfferSent -> Active` when the matching answer is applied
//! - `-> Closed | Failed` when the watchdog sees the connection end
//! - `OfferSent -> Failed` when no answer arrives within the offer timeout
//!
//! Answers are matched by the session id the offer carried. Untagged answers
//! are accepted only when the choice is unambiguous.

use crate::peer::{ConnectionState, PeerCapability, PeerConnector, PeerError};
use crate::signaling::{Inbound, Routing, SdpKind, SessionDescription, SignalingChannel, SignalingError};
use crate::watchdog::{SessionCloser, Watchdog};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, offer not sent yet
    Idle,
    /// Offer sent, waiting for the answer
    OfferSent,
    /// Answer applied
    Active,
    /// Connection ended normally
    Closed,
    /// Connection or setup failed
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, OfferSent)
                | (Idle, Failed)
                | (Idle, Closed)
                | (OfferSent, Active)
                | (OfferSent, Closed)
                | (OfferSent, Failed)
                | (Active, Closed)
                | (Active, Failed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("answer does not belong to any pending session")]
    AnswerWithoutPendingSession,
    #[error("untagged answer matches {0} pending sessions")]
    AmbiguousAnswer(usize),
    #[error("session {id}: peer capability creation failed: {reason}")]
    PeerCapabilityCreationFailed { id: u64, reason: String },
    #[error("session limit of {0} reached")]
    SessionLimit(usize),
    #[error("session {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: u64,
        from: SessionState,
        to: SessionState,
    },
    #[error("session {id}: {source}")]
    Peer {
        id: u64,
        #[source]
        source: PeerError,
    },
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// One receiver's connection attempt
pub struct StreamSession<P> {
    id: u64,
    peer_id: Option<u64>,
    state: Mutex<SessionState>,
    peer: Arc<P>,
    running: Arc<AtomicBool>,
    created_at: Instant,
    closed: AtomicBool,
}

impl<P: PeerCapability> StreamSession<P> {
    fn new(id: u64, peer_id: Option<u64>, peer: Arc<P>) -> Self {
        Self {
            id,
            peer_id,
            state: Mutex::new(SessionState::Idle),
            peer,
            running: Arc::new(AtomicBool::new(true)),
            created_at: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Relay peer id of the receiver this session was created for
    pub fn peer_id(&self) -> Option<u64> {
        self.peer_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Cleared by the watchdog once the connection ends
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn transition(&self, next: SessionState) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                id: self.id,
                from: *state,
                to: next,
            });
        }
        debug!("Session {} state change: {} -> {}", self.id, *state, next);
        *state = next;
        Ok(())
    }

    /// Move to a terminal state unless already there
    fn retire(&self, terminal: SessionState) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            debug!("Session {} state change: {} -> {}", self.id, *state, terminal);
            *state = terminal;
        }
    }

    /// Close the owned peer connection. Safe to call twice.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.retire(SessionState::Closed);
        if let Err(e) = self.peer.close().await {
            debug!("Session {}: {}", self.id, e);
        }
        info!("Session {} closed after {:.1}s", self.id, self.age().as_secs_f64());
    }
}

struct SessionTable<P> {
    sessions: Mutex<BTreeMap<u64, Arc<StreamSession<P>>>>,
}

impl<P: PeerCapability + 'static> SessionCloser for SessionTable<P> {
    fn session_terminated(&self, session_id: u64, state: ConnectionState) {
        let Some(session) = self.sessions.lock().remove(&session_id) else {
            return;
        };
        let terminal = if state == ConnectionState::Failed {
            SessionState::Failed
        } else {
            SessionState::Closed
        };
        session.retire(terminal);
        info!("Removed session {} due to state {}", session_id, state);

        // Called from the peer's state callback; the close runs on its own task.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { session.close().await });
        }
    }
}

/// Seconds an offer may wait for its answer unless configured otherwise
pub const DEFAULT_OFFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates and tracks one session per offer request
pub struct SessionManager<C: PeerConnector> {
    connector: C,
    media: Arc<C::Media>,
    table: Arc<SessionTable<C::Peer>>,
    next_id: AtomicU64,
    max_sessions: usize,
    offer_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl<C: PeerConnector> SessionManager<C> {
    pub fn new(connector: C, media: Arc<C::Media>, max_sessions: usize) -> Self {
        Self {
            connector,
            media,
            table: Arc::new(SessionTable {
                sessions: Mutex::new(BTreeMap::new()),
            }),
            next_id: AtomicU64::new(1),
            max_sessions,
            offer_timeout: DEFAULT_OFFER_TIMEOUT,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// How long a session may sit in `OfferSent` before it is failed
    pub fn with_offer_timeout(mut self, timeout: Duration) -> Self {
        self.offer_timeout = timeout;
        self
    }

    /// Flag the control loop checks between messages
    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn session_count(&self) -> usize {
        self.table.sessions.lock().len()
    }

    pub fn session(&self, id: u64) -> Option<Arc<StreamSession<C::Peer>>> {
        self.table.sessions.lock().get(&id).cloned()
    }

    pub fn state_of(&self, id: u64) -> Option<SessionState> {
        self.session(id).map(|s| s.state())
    }

    /// Create a session for `peer_id` and send its offer.
    ///
    /// Returns the new session id. If the peer cannot be created the id is
    /// still consumed but no session is recorded.
    pub async fn handle_request_offer(
        &self,
        channel: &dyn SignalingChannel,
        peer_id: Option<u64>,
    ) -> Result<u64, SessionError> {
        self.expire_stale_offers().await;
        if self.session_count() >= self.max_sessions {
            return Err(SessionError::SessionLimit(self.max_sessions));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let peer = self.connector.create_peer().await.map_err(|e| {
            error!("Session {} failed: {}", id, e);
            SessionError::PeerCapabilityCreationFailed {
                id,
                reason: e.to_string(),
            }
        })?;

        let session = Arc::new(StreamSession::new(id, peer_id, peer));
        self.table.sessions.lock().insert(id, session.clone());

        let table: Arc<dyn SessionCloser> = self.table.clone();
        let closer: Weak<dyn SessionCloser> = Arc::downgrade(&table);
        let watchdog = Watchdog::for_session(session.running.clone(), closer, id);
        session.peer.observe(watchdog);

        match self.send_offer(channel, &session).await {
            Ok(()) => {
                session.transition(SessionState::OfferSent)?;
                info!("Session {} offer sent (receiver {:?})", id, peer_id);
                Ok(id)
            }
            Err(e) => {
                self.fail(&session).await;
                Err(e)
            }
        }
    }

    async fn send_offer(
        &self,
        channel: &dyn SignalingChannel,
        session: &StreamSession<C::Peer>,
    ) -> Result<(), SessionError> {
        let id = session.id;
        let peer_err = |source| SessionError::Peer { id, source };

        self.connector
            .attach_media(&session.peer, &self.media)
            .await
            .map_err(peer_err)?;
        let offer = session.peer.create_offer().await.map_err(peer_err)?;
        let local = session
            .peer
            .set_local_description(&offer)
            .await
            .map_err(peer_err)?;

        let routing = Routing {
            session_id: Some(id),
            peer_id: session.peer_id,
        };
        channel.send_description(&local, routing).await?;
        Ok(())
    }

    /// Apply an answer to the session that sent the matching offer.
    ///
    /// Returns the id of the session that became active.
    pub async fn handle_answer(
        &self,
        answer: &SessionDescription,
        routing: Routing,
    ) -> Result<u64, SessionError> {
        let session = self.match_answer(routing)?;
        if let Err(source) = session.peer.set_remote_description(answer).await {
            self.fail(&session).await;
            return Err(SessionError::Peer {
                id: session.id,
                source,
            });
        }
        session.transition(SessionState::Active)?;
        info!("Session {} answer received and set", session.id);
        Ok(session.id)
    }

    fn match_answer(&self, routing: Routing) -> Result<Arc<StreamSession<C::Peer>>, SessionError> {
        let sessions = self.table.sessions.lock();

        if let Some(session_id) = routing.session_id {
            return sessions
                .get(&session_id)
                .filter(|s| s.state() == SessionState::OfferSent)
                .cloned()
                .ok_or(SessionError::AnswerWithoutPendingSession);
        }

        let pending: Vec<_> = sessions
            .values()
            .filter(|s| s.state() == SessionState::OfferSent)
            .collect();

        if let Some(peer_id) = routing.peer_id {
            let mut by_peer = pending.iter().filter(|s| s.peer_id == Some(peer_id));
            if let (Some(session), None) = (by_peer.next(), by_peer.next()) {
                return Ok(Arc::clone(*session));
            }
        }

        match pending.len() {
            0 => Err(SessionError::AnswerWithoutPendingSession),
            1 => Ok(Arc::clone(pending[0])),
            n => Err(SessionError::AmbiguousAnswer(n)),
        }
    }

    /// Fail every session whose offer has gone unanswered for longer than
    /// the offer timeout. Returns how many were removed.
    pub async fn expire_stale_offers(&self) -> usize {
        let stale: Vec<_> = {
            let mut table = self.table.sessions.lock();
            let ids: Vec<u64> = table
                .values()
                .filter(|s| s.state() == SessionState::OfferSent && s.age() >= self.offer_timeout)
                .map(|s| s.id)
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        for session in &stale {
            warn!(
                "Session {} got no answer within {:.1}s",
                session.id,
                self.offer_timeout.as_secs_f64()
            );
            session.retire(SessionState::Failed);
            session.close().await;
        }
        stale.len()
    }

    async fn fail(&self, session: &StreamSession<C::Peer>) {
        self.table.sessions.lock().remove(&session.id);
        session.retire(SessionState::Failed);
        session.close().await;
    }

    /// Handle one inbound signaling item. Returns false at end of stream.
    pub async fn handle_inbound(&self, channel: &dyn SignalingChannel, inbound: Inbound) -> bool {
        match inbound {
            Inbound::RequestOffer { peer_id } => {
                if let Err(e) = self.handle_request_offer(channel, peer_id).await {
                    warn!("Offer request for receiver {:?} not served: {}", peer_id, e);
                }
            }
            Inbound::Description {
                description,
                routing,
            } => match description.kind {
                SdpKind::Answer => {
                    if let Err(e) = self.handle_answer(&description, routing).await {
                        warn!("Dropping answer: {}", e);
                    }
                }
                SdpKind::Offer => {
                    let violation = SignalingError::ProtocolViolation("offer sent to sender".into());
                    warn!("Dropping message: {}", violation);
                }
            },
            Inbound::EndOfStream => {
                info!("Signaling ended");
                return false;
            }
        }
        true
    }

    /// Drive sessions from `channel` until it ends or [`stop`](Self::stop)
    /// is called, then close every session.
    pub async fn run(&self, channel: &dyn SignalingChannel, poll: Duration) {
        while self.running.load(Ordering::Acquire) {
            self.expire_stale_offers().await;
            let inbound = match tokio::time::timeout(poll, channel.receive()).await {
                Ok(inbound) => inbound,
                Err(_) => continue,
            };
            if !self.handle_inbound(channel, inbound).await {
                break;
            }
        }
        self.close_all().await;
    }

    /// Close and forget every session
    pub async fn close_all(&self) {
        let sessions: Vec<_> = {
            let mut table = self.table.sessions.lock();
            std::mem::take(&mut *table).into_values().collect()
        };
        for session in sessions {
            session.close().await;
        }
    }
}
