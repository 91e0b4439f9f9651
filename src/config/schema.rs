use serde::{Deserialize, Serialize};

use crate::video::transform::DetectedRegion;

// Re-export WebRtcConfig from webrtc module
pub use crate::webrtc::config::WebRtcConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Peer connection and session settings
    pub webrtc: WebRtcConfig,
    /// Face replacement settings
    pub transform: TransformConfig,
    /// Outbound H.264 encoder settings
    pub encoder: EncoderConfig,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// Which region detector feeds the transformer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// Never reports a region; frames are relayed untouched
    #[default]
    None,
    /// Reports `fixed_regions` on every frame
    Fixed,
}

/// Frame transform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Image pasted over every detected region; empty uses the built-in one
    pub substitute_image: String,
    /// Detector backend
    pub detector: DetectorKind,
    /// Regions reported by the `fixed` detector
    pub fixed_regions: Vec<DetectedRegion>,
    /// Minimum seconds between repeated per-track warnings
    pub log_throttle_secs: u64,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            substitute_image: String::new(),
            detector: DetectorKind::None,
            fixed_regions: vec![],
            log_throttle_secs: 5,
        }
    }
}

/// H.264 encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Frame rate assumed when a frame's duration cannot be derived
    pub fps: u32,
    /// Seconds between forced keyframes
    pub keyframe_interval_secs: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            keyframe_interval_secs: 2,
        }
    }
}
