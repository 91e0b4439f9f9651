//! Process-wide set of live peer sessions
//!
//! Every mutation goes through one mutex. Removal and the switch to a
//! terminal state happen together under that lock, so a session visible in
//! the registry is never terminal and only one closer ever wins. The slow
//! part of closing (transport teardown) runs after the lock is dropped.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::config::DEFAULT_MAX_SESSIONS;
use super::session::{CloseReason, PeerSession, SessionInfo};
use crate::error::{AppError, Result};

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<PeerSession>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Register a new session
    ///
    /// Fails with `ServiceUnavailable` when the registry is full.
    pub fn insert(&self, session: Arc<PeerSession>) -> Result<()> {
        let mut sessions = self.sessions.lock();
        if sessions.len() >= self.max_sessions {
            return Err(AppError::ServiceUnavailable(format!(
                "Maximum sessions ({}) reached",
                self.max_sessions
            )));
        }
        if session.state().is_terminal() {
            return Err(AppError::Internal(format!(
                "refusing to register closed session {}",
                session.id()
            )));
        }
        if sessions.contains_key(session.id()) {
            return Err(AppError::Internal(format!(
                "duplicate session id {}",
                session.id()
            )));
        }

        sessions.insert(session.id().to_string(), session);
        debug!("Registered session ({} live)", sessions.len());
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<_> = self.sessions.lock().values().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Deregister and close one session
    ///
    /// Returns false if the session is not registered, which is how a
    /// second close of the same session shows up.
    pub async fn close(&self, id: &str, reason: CloseReason) -> bool {
        let session = {
            let mut sessions = self.sessions.lock();
            match sessions.remove(id) {
                Some(session) => {
                    let began = session.begin_close(reason);
                    began.then_some(session)
                }
                None => None,
            }
        };

        match session {
            Some(session) => {
                session.release().await;
                true
            }
            None => {
                debug!("Session {} already closed", id);
                false
            }
        }
    }

    /// Close every registered session in parallel and wait for all of them
    ///
    /// Returns how many sessions were closed.
    pub async fn close_all(&self) -> usize {
        let sessions: Vec<_> = {
            let mut sessions = self.sessions.lock();
            sessions
                .drain()
                .map(|(_, session)| session)
                .filter(|session| session.begin_close(CloseReason::Shutdown))
                .collect()
        };

        if sessions.is_empty() {
            return 0;
        }

        info!("Closing {} session(s)", sessions.len());
        join_all(sessions.iter().map(|session| session.release())).await;
        sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::track::tests::identity_transformer;
    use crate::webrtc::session::SessionState;
    use crate::webrtc::signaling::tests::VALID_OFFER_SDP;
    use crate::webrtc::signaling::SessionDescription;
    use crate::webrtc::transport::mock::MockTransport;
    use tokio::sync::mpsc;

    async fn live_session(id: &str) -> (Arc<PeerSession>, Arc<MockTransport>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport::new(id, tx, false));
        let session = Arc::new(PeerSession::new(id, transport.clone(), identity_transformer(), 5));
        session
            .apply_remote_description(&SessionDescription::offer(VALID_OFFER_SDP))
            .await
            .unwrap();
        (session, transport)
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let registry = SessionRegistry::default();
        let (session, _) = live_session("a").await;

        registry.insert(session.clone()).unwrap();
        assert!(registry.contains("a"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ids(), vec!["a".to_string()]);
        assert!(Arc::ptr_eq(&registry.get("a").unwrap(), &session));

        // same id twice is refused
        assert!(registry.insert(session).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let registry = SessionRegistry::new(1);
        registry.insert(live_session("a").await.0).unwrap();

        let err = registry.insert(live_session("b").await.0).unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_double_close_is_noop() {
        let registry = SessionRegistry::default();
        let (session, transport) = live_session("a").await;
        registry.insert(session.clone()).unwrap();
        registry.insert(live_session("b").await.0).unwrap();

        assert!(registry.close("a", CloseReason::TransportFailed).await);
        assert!(!registry.close("a", CloseReason::Shutdown).await);

        assert_eq!(registry.ids(), vec!["b".to_string()]);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_session_close_leaves_registry_entry() {
        let registry = SessionRegistry::default();
        let (session, transport) = live_session("a").await;
        registry.insert(session.clone()).unwrap();

        assert!(session.close(CloseReason::NegotiationFailed).await);
        assert!(registry.contains("a"));

        // entry is dropped without a second release
        assert!(!registry.close("a", CloseReason::Shutdown).await);
        assert!(registry.is_empty());
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_racing_closes_release_once() {
        let registry = Arc::new(SessionRegistry::default());
        let (session, transport) = live_session("a").await;
        registry.insert(session.clone()).unwrap();

        let (failed, shutdown) = tokio::join!(
            registry.close("a", CloseReason::TransportFailed),
            registry.close_all()
        );
        assert_eq!(failed as usize + shutdown, 1);
        assert!(registry.is_empty());
        assert!(session.state().is_terminal());
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = SessionRegistry::default();
        let mut sessions = vec![];
        for id in ["a", "b", "c", "d"] {
            let (session, transport) = live_session(id).await;
            registry.insert(session.clone()).unwrap();
            sessions.push((session, transport));
        }

        assert_eq!(registry.close_all().await, 4);
        assert!(registry.is_empty());
        for (session, transport) in sessions {
            assert_eq!(session.state(), SessionState::Closed);
            assert_eq!(transport.close_calls(), 1);
        }

        assert_eq!(registry.close_all().await, 0);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let registry = SessionRegistry::default();
        registry.insert(live_session("a").await.0).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "a");
        assert_eq!(snapshot[0].state, SessionState::Negotiating);
    }
}
