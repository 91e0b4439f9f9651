//! Offer/answer entry point
//!
//! Turns one offer into one registered, negotiating session. Any failure
//! after the session was registered rolls it back out of the registry.

use std::sync::Arc;
use tracing::{info, warn};

use super::registry::SessionRegistry;
use super::session::{CloseReason, PeerSession};
use super::signaling::SessionDescription;
use super::transport::TransportFactory;
use crate::error::{AppError, Result};
use crate::video::transform::FrameTransformer;

pub struct SignalingEndpoint {
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn TransportFactory>,
    transformer: Arc<FrameTransformer>,
    log_throttle_secs: u64,
}

impl SignalingEndpoint {
    pub fn new(
        registry: Arc<SessionRegistry>,
        factory: Arc<dyn TransportFactory>,
        transformer: Arc<FrameTransformer>,
        log_throttle_secs: u64,
    ) -> Self {
        Self {
            registry,
            factory,
            transformer,
            log_throttle_secs,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Negotiate a new session from `offer` and return its answer
    pub async fn handle_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        offer.validate_offer()?;

        // Cheap early refusal; insert re-checks under the lock
        if self.registry.len() >= self.registry.max_sessions() {
            return Err(AppError::ServiceUnavailable(format!(
                "Maximum sessions ({}) reached",
                self.registry.max_sessions()
            )));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let (transport, events) = self.factory.create(&session_id).await?;
        let session = Arc::new(PeerSession::new(
            session_id.clone(),
            transport,
            self.transformer.clone(),
            self.log_throttle_secs,
        ));

        if let Err(e) = self.registry.insert(session.clone()) {
            session.close(CloseReason::NegotiationFailed).await;
            return Err(e);
        }

        let answer = match Self::negotiate(&session, &offer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Session {} negotiation failed: {}", session_id, e);
                self.registry
                    .close(&session_id, CloseReason::NegotiationFailed)
                    .await;
                return Err(e);
            }
        };

        tokio::spawn(
            session
                .clone()
                .run(events, Arc::downgrade(&self.registry)),
        );

        info!(
            "Session {} created ({} live)",
            session_id,
            self.registry.len()
        );
        Ok(answer)
    }

    async fn negotiate(
        session: &PeerSession,
        offer: &SessionDescription,
    ) -> Result<SessionDescription> {
        session.apply_remote_description(offer).await?;
        session.create_answer().await
    }
}
