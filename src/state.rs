use std::sync::Arc;

use crate::config::ConfigStore;
use crate::webrtc::{SessionRegistry, SignalingEndpoint};

/// Application-wide state shared across handlers
///
/// All session creation goes through `endpoint`; the registry is exposed
/// for listing and for the shutdown sweep.
pub struct AppState {
    /// Effective configuration, CLI overrides applied
    pub config: ConfigStore,
    /// Live peer sessions
    pub registry: Arc<SessionRegistry>,
    /// Offer/answer entry point
    pub endpoint: Arc<SignalingEndpoint>,
}

impl AppState {
    pub fn new(config: ConfigStore, endpoint: Arc<SignalingEndpoint>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: endpoint.registry().clone(),
            endpoint,
        })
    }
}
