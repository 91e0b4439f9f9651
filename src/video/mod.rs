//! Frame model and the face replacement pipeline
//!
//! Decoded frames flow through [`track::MediaTransformTrack`], which
//! restamps them, converts them to BGR24 and runs the shared
//! [`FrameTransformer`] before they are re-encoded for the peer.

pub mod clock;
pub mod convert;
pub mod frame;
pub mod track;
pub mod transform;

pub use clock::FrameClock;
pub use convert::{bgr24_to_i420, i420_to_bgr24, to_bgr24, to_i420};
pub use frame::{Frame, PixelLayout, TimeBase, VIDEO_CLOCK_RATE};
pub use track::{pump, FrameSink, FrameSource, MediaTransformTrack, PumpExit, TrackStats};
pub use transform::{
    DetectedRegion, FixedRegions, FrameTransformer, NoDetector, PassThrough, RegionDetector,
    SubstituteImage,
};
