//! WebRTC configuration

use serde::{Deserialize, Serialize};

/// Default cap on concurrently registered sessions
pub const DEFAULT_MAX_SESSIONS: usize = 8;

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Maximum number of live peer sessions; further offers get 503
    pub max_sessions: usize,
    /// ICE behaviour
    pub ice: IceConfig,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Host candidates are enough on a LAN; add STUN/TURN for remote peers
            stun_servers: vec![],
            turn_servers: vec![],
            max_sessions: DEFAULT_MAX_SESSIONS,
            ice: IceConfig::default(),
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

/// ICE configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// How long to wait for candidate gathering before answering anyway (ms)
    pub gathering_timeout_ms: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            gathering_timeout_ms: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WebRtcConfig::default();
        assert!(config.stun_servers.is_empty());
        assert_eq!(config.max_sessions, 8);
        assert_eq!(config.ice.gathering_timeout_ms, 5000);
    }

    #[test]
    fn test_partial_toml() {
        let config: WebRtcConfig = toml::from_str(
            r#"
            stun_servers = ["stun:stun.l.google.com:19302"]

            [[turn_servers]]
            urls = ["turn:turn.example.com:3478"]
            username = "relay"
            credential = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.stun_servers.len(), 1);
        assert_eq!(config.turn_servers[0].username, "relay");
        assert_eq!(config.max_sessions, DEFAULT_MAX_SESSIONS);
    }
}
