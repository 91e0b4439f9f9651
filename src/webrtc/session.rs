//! Peer session lifecycle
//!
//! ```text
//!   New --remote description--> Negotiating --transport up--> Connected
//!                                    |                            |
//!                                    +------ transport failed ----+--> Failed
//!   (any non-terminal) --------- shutdown / transport closed -------> Closed
//! ```
//!
//! `Failed` and `Closed` are terminal. Entering either one releases the
//! session's tracks and transport exactly once, however many close requests
//! race for it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::SessionRegistry;
use super::signaling::SessionDescription;
use super::transport::{
    EventReceiver, InboundTrack, PeerTransport, TrackKind, TransportEvent, TransportState,
};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::video::track::{pump, MediaTransformTrack, PumpExit, TrackStats};
use crate::video::transform::FrameTransformer;

/// Upper bound on how long release waits for the pump task to notice cancellation
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Negotiation state of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (New, Negotiating) => true,
            (Negotiating, Connected) => true,
            (Negotiating | Connected, Failed) => true,
            (New | Negotiating | Connected, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::New => write!(f, "new"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Failed => write!(f, "failed"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a session is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Process teardown
    Shutdown,
    /// Transport reported a connection failure
    TransportFailed,
    /// Transport closed on its own, or its event channel went away
    TransportClosed,
    /// Offer/answer exchange did not complete
    NegotiationFailed,
    /// Removed by an explicit cleanup request
    Removed,
}

impl CloseReason {
    /// The terminal state a session ends in for this reason
    pub fn terminal_state(self) -> SessionState {
        match self {
            CloseReason::TransportFailed | CloseReason::NegotiationFailed => SessionState::Failed,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::TransportFailed => write!(f, "transport failed"),
            CloseReason::TransportClosed => write!(f, "transport closed"),
            CloseReason::NegotiationFailed => write!(f, "negotiation failed"),
            CloseReason::Removed => write!(f, "removed"),
        }
    }
}

/// Point-in-time view of a session, as listed by the HTTP API
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub inbound_track: Option<String>,
}

/// One negotiated peer and the transform pipeline bound to it
pub struct PeerSession {
    id: String,
    transport: Arc<dyn PeerTransport>,
    transformer: Arc<FrameTransformer>,
    log_throttle_secs: u64,
    state_tx: watch::Sender<SessionState>,
    remote_description: Mutex<Option<SessionDescription>>,
    local_description: Mutex<Option<SessionDescription>>,
    inbound_track: Mutex<Option<String>>,
    pump_task: Mutex<Option<JoinHandle<(PumpExit, TrackStats)>>>,
    cancel: CancellationToken,
    released: AtomicBool,
    created_at: DateTime<Utc>,
}

impl PeerSession {
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        transformer: Arc<FrameTransformer>,
        log_throttle_secs: u64,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::New);
        Self {
            id: id.into(),
            transport,
            transformer,
            log_throttle_secs,
            state_tx,
            remote_description: Mutex::new(None),
            local_description: Mutex::new(None),
            inbound_track: Mutex::new(None),
            pump_task: Mutex::new(None),
            cancel: CancellationToken::new(),
            released: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().clone()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            state: self.state(),
            created_at: self.created_at,
            inbound_track: self.inbound_track.lock().clone(),
        }
    }

    /// Atomically move to `next` if the state machine allows it
    fn transition(&self, next: SessionState) -> bool {
        let mut from = None;
        let changed = self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            info!("Session {} state: {} -> {}", self.id, from, next);
        }
        changed
    }

    /// Apply the peer's offer and enter `Negotiating`
    pub async fn apply_remote_description(&self, offer: &SessionDescription) -> Result<()> {
        if self.state() != SessionState::New {
            return Err(AppError::BadRequest(format!(
                "session {} is {}, remote description already applied",
                self.id,
                self.state()
            )));
        }

        self.transport.set_remote_description(offer).await?;
        *self.remote_description.lock() = Some(offer.clone());

        if !self.transition(SessionState::Negotiating) {
            return Err(AppError::TransportFailure(format!(
                "session {} closed during negotiation",
                self.id
            )));
        }
        Ok(())
    }

    /// Generate the local answer; the remote description must be applied first
    pub async fn create_answer(&self) -> Result<SessionDescription> {
        if self.state() != SessionState::Negotiating {
            return Err(AppError::Internal(format!(
                "answer requested for session {} in state {}",
                self.id,
                self.state()
            )));
        }

        let answer = self.transport.create_answer().await?;
        *self.local_description.lock() = Some(answer.clone());
        Ok(answer)
    }

    /// React to one transport event
    ///
    /// Never blocks: media work is spawned onto its own task. Returns the
    /// close reason when the event ends the session.
    pub fn handle_event(&self, event: TransportEvent) -> Option<CloseReason> {
        match event {
            TransportEvent::StateChanged(state) => self.handle_state(state),
            TransportEvent::TrackAdded(track) => {
                self.attach_inbound(track);
                None
            }
        }
    }

    fn handle_state(&self, state: TransportState) -> Option<CloseReason> {
        debug!("Session {} transport state: {}", self.id, state);
        match state {
            TransportState::Connected => {
                self.transition(SessionState::Connected);
                None
            }
            TransportState::Failed => Some(CloseReason::TransportFailed),
            TransportState::Closed => Some(CloseReason::TransportClosed),
            TransportState::Disconnected => {
                info!("Session {} transport disconnected, waiting for recovery", self.id);
                None
            }
            TransportState::New | TransportState::Connecting => None,
        }
    }

    fn attach_inbound(&self, track: InboundTrack) {
        if track.kind != TrackKind::Video {
            debug!("Session {} ignoring non-video track {}", self.id, track.id);
            return;
        }
        if self.state().is_terminal() {
            debug!("Session {} already closed, dropping track {}", self.id, track.id);
            return;
        }

        let mut inbound = self.inbound_track.lock();
        if let Some(current) = inbound.as_ref() {
            warn!(
                "Session {} already relays track {}, ignoring additional track {}",
                self.id, current, track.id
            );
            return;
        }

        let Some(sink) = self.transport.take_video_sink() else {
            warn!("Session {} has no outbound video track, ignoring {}", self.id, track.id);
            return;
        };

        info!("Session {} relaying inbound video track {}", self.id, track.id);
        *inbound = Some(track.id.clone());

        let transform_track = MediaTransformTrack::new(
            format!("{}/{}", self.id, track.id),
            track.source,
            self.transformer.clone(),
            LogThrottler::with_secs(self.log_throttle_secs),
        );
        let handle = tokio::spawn(pump(transform_track, sink, self.cancel.child_token()));
        *self.pump_task.lock() = Some(handle);
    }

    /// Dispatch transport events until the session ends
    ///
    /// Terminal events are routed through the registry when it is still
    /// alive, so deregistration and release happen together.
    pub async fn run(self: Arc<Self>, mut events: EventReceiver, registry: Weak<SessionRegistry>) {
        let reason = loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                event = events.recv() => event,
            };

            match event {
                Some(event) => {
                    if let Some(reason) = self.handle_event(event) {
                        break Some(reason);
                    }
                }
                None => break Some(CloseReason::TransportClosed),
            }
        };

        if let Some(reason) = reason {
            match registry.upgrade() {
                Some(registry) => {
                    registry.close(&self.id, reason).await;
                }
                None => {
                    self.close(reason).await;
                }
            }
        }
        debug!("Session {} dispatch loop finished", self.id);
    }

    /// Enter the terminal state for `reason`
    ///
    /// Returns false when the session was already terminal. Does not
    /// release resources; pair with `release`.
    pub(crate) fn begin_close(&self, reason: CloseReason) -> bool {
        let target = reason.terminal_state();
        if self.transition(target) {
            info!("Session {} closing: {}", self.id, reason);
            return true;
        }
        // Failed is not reachable from New; close it instead
        target == SessionState::Failed && self.transition(SessionState::Closed)
    }

    /// Cancel the media pipeline and tear down the transport, once
    pub(crate) async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel.cancel();

        let task = self.pump_task.lock().take();
        if let Some(task) = task {
            match tokio::time::timeout(PUMP_JOIN_TIMEOUT, task).await {
                Ok(Ok((exit, stats))) => {
                    debug!("Session {} track finished: {:?}, {:?}", self.id, exit, stats)
                }
                Ok(Err(e)) => warn!("Session {} track task failed: {}", self.id, e),
                Err(_) => warn!("Session {} track task did not stop in time", self.id),
            }
        }

        if let Err(e) = self.transport.close().await {
            warn!("Session {} transport close failed: {}", self.id, e);
        }
        info!("Session {} released ({})", self.id, self.state());
    }

    /// Close the session; a repeated close is a no-op that returns false
    ///
    /// Does not touch the registry. Outside the crate sessions are closed
    /// through `SessionRegistry::close`, which also removes the entry.
    pub(crate) async fn close(&self, reason: CloseReason) -> bool {
        if !self.begin_close(reason) {
            return false;
        }
        self.release().await;
        true
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::track::tests::{identity_transformer, PendingSource, ScriptedSource};
    use crate::webrtc::signaling::tests::VALID_OFFER_SDP;
    use crate::webrtc::transport::mock::MockTransport;
    use tokio::sync::mpsc;

    fn session() -> (Arc<PeerSession>, Arc<MockTransport>, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport::new("s1", tx, false));
        let session = Arc::new(PeerSession::new(
            "s1",
            transport.clone(),
            identity_transformer(),
            5,
        ));
        (session, transport, rx)
    }

    fn video(id: &str, source: impl crate::video::track::FrameSource + 'static) -> TransportEvent {
        TransportEvent::TrackAdded(InboundTrack {
            id: id.to_string(),
            kind: TrackKind::Video,
            source: Box::new(source),
        })
    }

    async fn negotiated() -> (Arc<PeerSession>, Arc<MockTransport>, EventReceiver) {
        let (session, transport, rx) = session();
        session
            .apply_remote_description(&SessionDescription::offer(VALID_OFFER_SDP))
            .await
            .unwrap();
        (session, transport, rx)
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert!(New.can_transition_to(Negotiating));
        assert!(Negotiating.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Failed));
        assert!(Negotiating.can_transition_to(Failed));
        assert!(New.can_transition_to(Closed));
        assert!(!New.can_transition_to(Connected));
        assert!(!Failed.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Failed));
        assert!(!Closed.can_transition_to(New));
    }

    #[tokio::test]
    async fn test_negotiation_order() {
        let (session, _transport, _rx) = session();

        // answer before remote description is refused
        assert!(session.create_answer().await.is_err());
        assert_eq!(session.state(), SessionState::New);

        session
            .apply_remote_description(&SessionDescription::offer(VALID_OFFER_SDP))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Negotiating);

        let answer = session.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, "answer");
        assert_eq!(session.local_description(), Some(answer));
        assert!(session.remote_description().is_some());
    }

    #[tokio::test]
    async fn test_connected_then_failed() {
        let (session, transport, _rx) = negotiated().await;

        let event = TransportEvent::StateChanged(TransportState::Connected);
        assert_eq!(session.handle_event(event), None);
        assert_eq!(session.state(), SessionState::Connected);

        let event = TransportEvent::StateChanged(TransportState::Disconnected);
        assert_eq!(session.handle_event(event), None);
        assert_eq!(session.state(), SessionState::Connected);

        let event = TransportEvent::StateChanged(TransportState::Failed);
        assert_eq!(session.handle_event(event), Some(CloseReason::TransportFailed));

        assert!(session.close(CloseReason::TransportFailed).await);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_double_close_is_noop() {
        let (session, transport, _rx) = negotiated().await;

        let (a, b) = tokio::join!(
            session.close(CloseReason::TransportFailed),
            session.close(CloseReason::Shutdown)
        );
        assert!(a ^ b);
        assert!(session.state().is_terminal());
        assert_eq!(transport.close_calls(), 1);

        assert!(!session.close(CloseReason::Shutdown).await);
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_before_negotiation_closes() {
        let (session, _transport, _rx) = session();
        assert!(session.close(CloseReason::NegotiationFailed).await);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_first_inbound_track_wins() {
        let (session, transport, _rx) = negotiated().await;

        session.handle_event(video("first", ScriptedSource::with_pts(&[0, 3000])));
        session.handle_event(video("second", ScriptedSource::with_pts(&[0])));
        assert_eq!(session.info().inbound_track.as_deref(), Some("first"));

        let mut outbound = transport.outbound.lock().take().unwrap();
        let first = outbound.recv().await.unwrap();
        let second = outbound.recv().await.unwrap();
        assert!(second.pts() > first.pts());
    }

    #[tokio::test]
    async fn test_audio_track_ignored() {
        let (session, _transport, _rx) = negotiated().await;
        session.handle_event(TransportEvent::TrackAdded(InboundTrack {
            id: "mic".to_string(),
            kind: TrackKind::Audio,
            source: Box::new(PendingSource),
        }));
        assert_eq!(session.info().inbound_track, None);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_frame_wait() {
        let (session, transport, _rx) = negotiated().await;
        session.handle_event(video("cam", PendingSource));

        let closed = tokio::time::timeout(
            Duration::from_secs(1),
            session.close(CloseReason::Shutdown),
        )
        .await
        .unwrap();
        assert!(closed);
        assert!(session.pump_task.lock().is_none());
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_run_closes_on_transport_failure() {
        let (session, transport, rx) = negotiated().await;
        let handle = tokio::spawn(session.clone().run(rx, Weak::new()));

        transport.emit(TransportEvent::StateChanged(TransportState::Connected));
        transport.emit(TransportEvent::StateChanged(TransportState::Failed));

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(transport.close_calls(), 1);
    }
}
