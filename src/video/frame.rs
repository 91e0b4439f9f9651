//! Video frame data structures

use std::fmt;

use crate::error::{AppError, Result};

/// RTP clock rate used for every video track (90 kHz)
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Pixel layout of a frame's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// Three interleaved 8-bit planes per pixel in B, G, R order, no row padding
    Bgr24,
    /// Planar YUV 4:2:0: full-size Y plane followed by quarter-size U and V planes
    I420,
}

impl PixelLayout {
    /// Buffer size in bytes for a frame of the given dimensions
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelLayout::Bgr24 => w * h * 3,
            PixelLayout::I420 => {
                let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
                w * h + 2 * cw * ch
            }
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelLayout::Bgr24 => write!(f, "bgr24"),
            PixelLayout::I420 => write!(f, "i420"),
        }
    }
}

/// Unit fraction that converts a presentation timestamp to seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// 1/90000, the video RTP clock
    pub const fn video() -> Self {
        Self::new(1, VIDEO_CLOCK_RATE)
    }

    /// Rescale `pts` expressed in `self` into `target`, rounding to nearest
    pub fn rescale(&self, pts: i64, target: TimeBase) -> i64 {
        if *self == target {
            return pts;
        }
        let num = pts as i128 * self.num as i128 * target.den as i128;
        let den = self.den as i128 * target.num as i128;
        if den == 0 {
            return pts;
        }
        let half = den / 2;
        let rounded = if num >= 0 { (num + half) / den } else { (num - half) / den };
        rounded as i64
    }

    /// Convert a timestamp delta into wall-clock duration
    pub fn to_duration(&self, ticks: i64) -> std::time::Duration {
        if ticks <= 0 || self.den == 0 {
            return std::time::Duration::ZERO;
        }
        let nanos = ticks as u128 * self.num as u128 * 1_000_000_000 / self.den as u128;
        std::time::Duration::from_nanos(nanos as u64)
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::video()
    }
}

impl fmt::Display for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// A video frame: pixel buffer plus presentation timestamp
///
/// Frames are passed by value through the pipeline. The buffer is private,
/// so a frame that has been handed downstream cannot be mutated; a stage
/// that owns a frame may take its buffer with [`Frame::into_data`] and
/// rebuild a new frame from it.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    layout: PixelLayout,
    pts: i64,
    time_base: TimeBase,
}

impl Frame {
    /// Create a frame, checking the buffer length against the layout
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        pts: i64,
        time_base: TimeBase,
    ) -> Result<Self> {
        let expected = layout.frame_size(width, height);
        if data.len() != expected {
            return Err(AppError::VideoError(format!(
                "{} frame {}x{} needs {} bytes, got {}",
                layout,
                width,
                height,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            layout,
            pts,
            time_base,
        })
    }

    /// Rebuild a frame from a buffer taken out of a frame of the same geometry
    pub(crate) fn from_parts(
        data: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        pts: i64,
        time_base: TimeBase,
    ) -> Self {
        debug_assert_eq!(data.len(), layout.frame_size(width, height));
        Self {
            data,
            width,
            height,
            layout,
            pts,
            time_base,
        }
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take ownership of the pixel buffer
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn pts(&self) -> i64 {
        self.pts
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    /// Same pixels, new timestamp
    pub fn with_timestamp(mut self, pts: i64, time_base: TimeBase) -> Self {
        self.pts = pts;
        self.time_base = time_base;
        self
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .field("pts", &self.pts)
            .field("time_base", &self.time_base)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        assert_eq!(PixelLayout::Bgr24.frame_size(4, 2), 24);
        assert_eq!(PixelLayout::I420.frame_size(4, 2), 8 + 2 * 2);
        // odd dimensions round the chroma planes up
        assert_eq!(PixelLayout::I420.frame_size(3, 3), 9 + 2 * 4);
    }

    #[test]
    fn test_frame_rejects_wrong_length() {
        let result = Frame::new(vec![0; 10], 2, 2, PixelLayout::Bgr24, 0, TimeBase::video());
        assert!(result.is_err());
    }

    #[test]
    fn test_rescale() {
        let ms = TimeBase::new(1, 1000);
        assert_eq!(ms.rescale(1000, TimeBase::video()), 90_000);
        assert_eq!(TimeBase::video().rescale(3000, ms), 33);
        assert_eq!(ms.rescale(-5, ms), -5);
    }

    #[test]
    fn test_to_duration() {
        let tb = TimeBase::video();
        assert_eq!(tb.to_duration(3000).as_micros(), 33_333);
        assert_eq!(tb.to_duration(0), std::time::Duration::ZERO);
        assert_eq!(tb.to_duration(-1), std::time::Duration::ZERO);
    }
}
