//! Pull-based transform track
//!
//! ```text
//! FrameSource (inbound, decoded)
//!        |  recv().await          <- only suspension point
//!        v
//! FrameClock (strictly increasing pts)
//!        |
//!        v
//! to_bgr24 -> FrameTransformer    <- synchronous CPU work
//!        |
//!        v
//! FrameSink (outbound, encoded)
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::clock::FrameClock;
use super::convert;
use super::frame::{Frame, TimeBase};
use super::transform::{FrameTransformer, PassThrough};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Inbound side of a track: yields raw frames in arrival order
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame
    ///
    /// Returns `AppError::UpstreamEnded` once the inbound track has
    /// terminated; every later call returns the same.
    async fn recv(&mut self) -> Result<Frame>;
}

/// Outbound side of a track
#[async_trait]
pub trait FrameSink: Send {
    async fn write_frame(&mut self, frame: Frame) -> Result<()>;
}

/// Per-track counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackStats {
    /// Frames produced by `recv`
    pub frames: u64,
    /// Frames whose transform failed and were passed through untouched
    pub passed_through: u64,
    /// Inbound timestamps that had to be clamped forward
    pub clamped_timestamps: u64,
}

/// Wraps an inbound source and yields transformed, re-timestamped frames
pub struct MediaTransformTrack {
    id: String,
    source: Box<dyn FrameSource>,
    clock: FrameClock,
    transformer: Arc<FrameTransformer>,
    throttler: LogThrottler,
    stats: TrackStats,
}

impl MediaTransformTrack {
    pub fn new(
        id: impl Into<String>,
        source: Box<dyn FrameSource>,
        transformer: Arc<FrameTransformer>,
        throttler: LogThrottler,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            clock: FrameClock::new(TimeBase::video()),
            transformer,
            throttler,
            stats: TrackStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> TrackStats {
        self.stats
    }

    /// Produce the next outbound frame
    pub async fn recv(&mut self) -> Result<Frame> {
        let raw = self.source.recv().await?;

        let inbound_pts = raw.pts();
        let inbound_base = raw.time_base();
        let (pts, time_base) = self.clock.stamp(inbound_pts, inbound_base);
        if pts != inbound_base.rescale(inbound_pts, time_base) {
            self.stats.clamped_timestamps += 1;
            trace!("Track {} clamped pts {} -> {}", self.id, inbound_pts, pts);
        }

        let frame = convert::to_bgr24(raw.with_timestamp(pts, time_base));
        self.stats.frames += 1;

        match self.transformer.transform(frame) {
            Ok(frame) => Ok(frame),
            Err(PassThrough { frame, error }) => {
                self.stats.passed_through += 1;
                warn_throttled!(
                    self.throttler,
                    "transform",
                    "Track {}: {}, passing frame through",
                    self.id,
                    error
                );
                Ok(frame)
            }
        }
    }
}

/// Why a pump loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The owning session closed
    Cancelled,
    /// The inbound track terminated
    UpstreamEnded,
}

/// Drive `track` into `sink` until upstream ends or `cancel` fires
///
/// Sink write failures are logged and the frame dropped; the stream keeps
/// going, matching the pass-through policy of the transform step.
pub async fn pump(
    mut track: MediaTransformTrack,
    mut sink: Box<dyn FrameSink>,
    cancel: CancellationToken,
) -> (PumpExit, TrackStats) {
    let sink_throttler = LogThrottler::default();

    let exit = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpExit::Cancelled,
            frame = track.recv() => frame,
        };

        match frame {
            Ok(frame) => {
                if let Err(e) = sink.write_frame(frame).await {
                    warn_throttled!(sink_throttler, "sink", "Track {}: write failed: {}", track.id(), e);
                }
            }
            Err(AppError::UpstreamEnded) => break PumpExit::UpstreamEnded,
            Err(e) => {
                // Any other source error ends the inbound side as well
                debug!("Track {} source error: {}", track.id(), e);
                break PumpExit::UpstreamEnded;
            }
        }
    };

    debug!("Track {} stopped: {:?} ({:?})", track.id(), exit, track.stats());
    (exit, track.stats())
}
