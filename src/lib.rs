//! face-relay - WebRTC video relay with face replacement
//!
//! Browsers post an SDP offer, send their camera track, and receive the
//! same video back with every detected face covered by a substitute image.

pub mod config;
pub mod error;
pub mod state;
pub mod utils;
pub mod video;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
