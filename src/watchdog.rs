//! Connection watchdog
//!
//! Observes peer-connection state changes. On the first terminal state it
//! clears the shared `running` flag and, for sender-side sessions, tells the
//! session table to retire the session. Waiting for the connection to come up
//! goes through a watch channel instead of polling.

use crate::peer::ConnectionState;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// Receives connection state changes from a peer capability
pub trait ConnectionObserver: Send + Sync {
    fn on_state_change(&self, state: ConnectionState);
}

/// Sender-side hook that retires a session whose connection ended
pub trait SessionCloser: Send + Sync {
    fn session_terminated(&self, session_id: u64, state: ConnectionState);
}

/// Watchdog errors
#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("connection {0} before it was established")]
    ConnectionEnded(ConnectionState),
    #[error("connection not established within {0:?}")]
    Timeout(Duration),
}

pub struct Watchdog {
    running: Arc<AtomicBool>,
    tripped: AtomicBool,
    state: watch::Sender<ConnectionState>,
    session: Option<(Weak<dyn SessionCloser>, u64)>,
}

impl Watchdog {
    /// Watchdog that only controls `running`
    pub fn new(running: Arc<AtomicBool>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::New);
        Arc::new(Self {
            running,
            tripped: AtomicBool::new(false),
            state,
            session: None,
        })
    }

    /// Watchdog bound to a sender-side session
    pub fn for_session(
        running: Arc<AtomicBool>,
        closer: Weak<dyn SessionCloser>,
        session_id: u64,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::New);
        Arc::new(Self {
            running,
            tripped: AtomicBool::new(false),
            state,
            session: Some((closer, session_id)),
        })
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection is up.
    ///
    /// Fails if it reaches a terminal state first or `timeout` elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), WatchdogError> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| *s == ConnectionState::Connected || s.is_terminal()),
        )
        .await;
        match waited {
            Ok(Ok(state)) if *state == ConnectionState::Connected => Ok(()),
            Ok(Ok(state)) => Err(WatchdogError::ConnectionEnded(*state)),
            Ok(Err(_)) => Err(WatchdogError::ConnectionEnded(ConnectionState::Closed)),
            Err(_) => Err(WatchdogError::Timeout(timeout)),
        }
    }
}

impl ConnectionObserver for Watchdog {
    fn on_state_change(&self, state: ConnectionState) {
        info!("Connection state: {}", state);
        self.state.send_replace(state);

        if !state.is_terminal() || self.tripped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);

        if let Some((closer, session_id)) = &self.session {
            if let Some(closer) = closer.upgrade() {
                closer.session_terminated(*session_id, state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingCloser {
        calls: Mutex<Vec<(u64, ConnectionState)>>,
    }

    impl SessionCloser for RecordingCloser {
        fn session_terminated(&self, session_id: u64, state: ConnectionState) {
            self.calls.lock().push((session_id, state));
        }
    }

    #[test]
    fn terminal_state_clears_running_once() {
        let running = Arc::new(AtomicBool::new(true));
        let closer = Arc::new(RecordingCloser::default());
        let weak: Weak<dyn SessionCloser> = Arc::downgrade(&(closer.clone() as Arc<dyn SessionCloser>));
        let watchdog = Watchdog::for_session(running.clone(), weak, 4);

        watchdog.on_state_change(ConnectionState::Connected);
        assert!(running.load(Ordering::Acquire));

        watchdog.on_state_change(ConnectionState::Failed);
        watchdog.on_state_change(ConnectionState::Closed);
        assert!(!running.load(Ordering::Acquire));
        assert_eq!(*closer.calls.lock(), vec![(4, ConnectionState::Failed)]);
    }

    #[tokio::test]
    async fn wait_connected_resolves_on_transition() {
        let watchdog = Watchdog::new(Arc::new(AtomicBool::new(true)));
        let notifier = watchdog.clone();
        tokio::spawn(async move {
            notifier.on_state_change(ConnectionState::Connecting);
            notifier.on_state_change(ConnectionState::Connected);
        });
        watchdog
            .wait_connected(Duration::from_secs(5))
            .await
            .expect("connected");
    }

    #[tokio::test]
    async fn wait_connected_reports_failure() {
        let watchdog = Watchdog::new(Arc::new(AtomicBool::new(true)));
        watchdog.on_state_change(ConnectionState::Failed);
        let err = watchdog.wait_connected(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, WatchdogError::ConnectionEnded(ConnectionState::Failed)));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_connected_times_out() {
        let watchdog = Watchdog::new(Arc::new(AtomicBool::new(true)));
        let err = watchdog.wait_connected(Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, WatchdogError::Timeout(_)));
    }
}
