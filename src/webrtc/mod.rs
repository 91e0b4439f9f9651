//! WebRTC sessions for the face relay
//!
//! ```text
//! Browser --POST /offer--> SignalingEndpoint --create--> PeerSession --insert--> SessionRegistry
//!                                                            |
//!                          RtcTransport (webrtc-rs) --events-+--> dispatch loop
//!                                 |                                  |
//!                        inbound H.264 track               MediaTransformTrack
//!                                 |                                  |
//!                          RtpH264Source ---> FrameClock -> FrameTransformer ---> H264Sink
//!                                                                                    |
//! Browser <----------------------------- outbound H.264 track <----------------------+
//! ```

pub mod config;
pub mod endpoint;
pub mod h264;
pub mod mdns;
pub mod peer;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{IceConfig, TurnServer, WebRtcConfig};
pub use endpoint::SignalingEndpoint;
pub use peer::{RtcTransport, RtcTransportFactory};
pub use registry::SessionRegistry;
pub use session::{CloseReason, PeerSession, SessionInfo, SessionState};
pub use signaling::{SdpType, SessionDescription};
pub use transport::{PeerTransport, TransportEvent, TransportFactory, TransportState};
