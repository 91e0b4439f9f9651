//! Transport seam between a session and the WebRTC stack
//!
//! The peer connection reports everything it knows through a per-session
//! event channel. Callbacks only push onto that channel; all decisions are
//! made by the session's dispatch loop.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::signaling::SessionDescription;
use crate::error::Result;
use crate::video::track::{FrameSink, FrameSource};

/// Connection state as reported by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::New => write!(f, "new"),
            TransportState::Connecting => write!(f, "connecting"),
            TransportState::Connected => write!(f, "connected"),
            TransportState::Disconnected => write!(f, "disconnected"),
            TransportState::Failed => write!(f, "failed"),
            TransportState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// A remote track that just arrived, with a decoded frame source over it
pub struct InboundTrack {
    pub id: String,
    pub kind: TrackKind,
    pub source: Box<dyn FrameSource>,
}

impl fmt::Debug for InboundTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Typed events emitted by a transport onto its session's channel
#[derive(Debug)]
pub enum TransportEvent {
    StateChanged(TransportState),
    TrackAdded(InboundTrack),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// One negotiated media transport
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Apply the peer's offer
    async fn set_remote_description(&self, offer: &SessionDescription) -> Result<()>;

    /// Generate, apply and return the local answer
    ///
    /// Only valid after `set_remote_description` succeeded.
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Hand out the outbound video sink; `None` after the first call
    fn take_video_sink(&self) -> Option<Box<dyn FrameSink>>;

    /// Tear down the transport; must tolerate repeated calls
    async fn close(&self) -> Result<()>;
}

/// Creates transports, one per session
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, session_id: &str) -> Result<(Arc<dyn PeerTransport>, EventReceiver)>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::error::AppError;
    use crate::video::frame::Frame;
    use crate::video::track::tests::ChannelSink;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory transport with scripted failures
    pub(crate) struct MockTransport {
        pub(crate) session_id: String,
        pub(crate) events: EventSender,
        pub(crate) remote_set: AtomicBool,
        pub(crate) close_calls: AtomicUsize,
        pub(crate) fail_answer: bool,
        sink: Mutex<Option<Box<dyn FrameSink>>>,
        pub(crate) outbound: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    }

    impl MockTransport {
        pub(crate) fn new(session_id: &str, events: EventSender, fail_answer: bool) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                session_id: session_id.to_string(),
                events,
                remote_set: AtomicBool::new(false),
                close_calls: AtomicUsize::new(0),
                fail_answer,
                sink: Mutex::new(Some(Box::new(ChannelSink(tx)))),
                outbound: Mutex::new(Some(rx)),
            }
        }

        pub(crate) fn emit(&self, event: TransportEvent) {
            let _ = self.events.send(event);
        }

        pub(crate) fn close_calls(&self) -> usize {
            self.close_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PeerTransport for MockTransport {
        async fn set_remote_description(&self, offer: &SessionDescription) -> Result<()> {
            offer.validate_offer()?;
            self.remote_set.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            if !self.remote_set.load(Ordering::SeqCst) {
                return Err(AppError::WebRtcError("answer before remote description".into()));
            }
            if self.fail_answer {
                return Err(AppError::WebRtcError("scripted answer failure".into()));
            }
            Ok(SessionDescription::answer(format!(
                "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns={}\r\nt=0 0\r\n",
                self.session_id
            )))
        }

        fn take_video_sink(&self) -> Option<Box<dyn FrameSink>> {
            self.sink.lock().take()
        }

        async fn close(&self) -> Result<()> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Factory that remembers every transport it built
    #[derive(Default)]
    pub(crate) struct MockFactory {
        pub(crate) fail_answer: bool,
        pub(crate) created: Mutex<Vec<Arc<MockTransport>>>,
    }

    impl MockFactory {
        pub(crate) fn failing_answer() -> Self {
            Self {
                fail_answer: true,
                ..Default::default()
            }
        }

        pub(crate) fn transport(&self, session_id: &str) -> Option<Arc<MockTransport>> {
            self.created
                .lock()
                .iter()
                .find(|t| t.session_id == session_id)
                .cloned()
        }
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn create(
            &self,
            session_id: &str,
        ) -> Result<(Arc<dyn PeerTransport>, EventReceiver)> {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Arc::new(MockTransport::new(session_id, tx, self.fail_answer));
            self.created.lock().push(transport.clone());
            Ok((transport, rx))
        }
    }
}
