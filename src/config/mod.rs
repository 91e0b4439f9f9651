//! Configuration schema and loading

mod schema;
mod store;

pub use schema::{AppConfig, DetectorKind, EncoderConfig, TransformConfig, WebConfig, WebRtcConfig};
pub use store::ConfigStore;
