//! Face replacement transform
//!
//! [`FrameTransformer`] runs a [`RegionDetector`] over a BGR24 frame and
//! pastes a resized [`SubstituteImage`] over every reported region, in
//! detection order (later regions overwrite earlier ones, no blending).
//! It holds no mutable state, so one instance is shared by every track.

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use rust_embed::Embed;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use super::frame::{Frame, PixelLayout};
use crate::config::{DetectorKind, TransformConfig};
use crate::error::{AppError, Result};

/// Images compiled into the binary
#[derive(Embed)]
#[folder = "assets"]
struct BuiltinAssets;

const BUILTIN_SUBSTITUTE: &str = "substitute.png";

/// Axis-aligned rectangle in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DetectedRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DetectedRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Visible (width, height) of the region inside a `frame_w` x `frame_h` frame
    fn visible_size(&self, frame_w: u32, frame_h: u32) -> Option<(u32, u32)> {
        if self.width == 0 || self.height == 0 || self.x >= frame_w || self.y >= frame_h {
            return None;
        }
        Some((
            self.width.min(frame_w - self.x),
            self.height.min(frame_h - self.y),
        ))
    }

    /// Whether the pixel (`px`, `py`) lies inside the region
    pub fn contains(&self, px: u32, py: u32) -> bool {
        px >= self.x
            && py >= self.y
            && (px as u64) < self.x as u64 + self.width as u64
            && (py as u64) < self.y as u64 + self.height as u64
    }
}

/// Face detection capability
///
/// Implementations receive frames in [`PixelLayout::Bgr24`] and must not
/// block on I/O: detection runs synchronously on the per-frame path.
pub trait RegionDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<DetectedRegion>>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Detector that never reports a region
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDetector;

impl RegionDetector for NoDetector {
    fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedRegion>> {
        Ok(vec![])
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Detector that reports the same configured regions on every frame
#[derive(Debug, Default, Clone)]
pub struct FixedRegions {
    regions: Vec<DetectedRegion>,
}

impl FixedRegions {
    pub fn new(regions: Vec<DetectedRegion>) -> Self {
        Self { regions }
    }
}

impl RegionDetector for FixedRegions {
    fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedRegion>> {
        Ok(self.regions.clone())
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// The image pasted over detected regions
///
/// Pixels are kept in B, G, R order inside an `RgbImage` container so they
/// can be copied straight into BGR24 frames.
#[derive(Debug, Clone)]
pub struct SubstituteImage {
    image: RgbImage,
}

impl SubstituteImage {
    /// Load from any format the `image` crate can decode
    pub fn load(path: &Path) -> Result<Self> {
        let decoded = image::open(path).map_err(|e| {
            AppError::Config(format!("Failed to load substitute image {}: {}", path.display(), e))
        })?;
        Ok(Self::from_decoded(decoded))
    }

    /// The image shipped inside the binary
    pub fn builtin() -> Result<Self> {
        let asset = BuiltinAssets::get(BUILTIN_SUBSTITUTE).ok_or_else(|| {
            AppError::Internal(format!("built-in {} is not embedded", BUILTIN_SUBSTITUTE))
        })?;
        let decoded = image::load_from_memory(&asset.data).map_err(|e| {
            AppError::Internal(format!("built-in substitute image is corrupt: {}", e))
        })?;
        Ok(Self::from_decoded(decoded))
    }

    /// Configured path, or the built-in image when the path is empty
    pub fn from_config(path: &str) -> Result<Self> {
        if path.trim().is_empty() {
            Self::builtin()
        } else {
            Self::load(Path::new(path))
        }
    }

    fn from_decoded(decoded: DynamicImage) -> Self {
        let mut image = decoded.to_rgb8();
        for pixel in image.pixels_mut() {
            pixel.0.swap(0, 2);
        }
        Self { image }
    }

    /// Build from a BGR24 buffer
    pub fn from_bgr(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let image = RgbImage::from_raw(width, height, data).ok_or_else(|| {
            AppError::Config(format!("Substitute buffer does not match {}x{}", width, height))
        })?;
        if width == 0 || height == 0 {
            return Err(AppError::Config("Substitute image is empty".to_string()));
        }
        Ok(Self { image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// The substitute scaled to exactly `width` x `height`
    pub fn resized(&self, width: u32, height: u32) -> RgbImage {
        if width == self.image.width() && height == self.image.height() {
            return self.image.clone();
        }
        imageops::resize(&self.image, width, height, FilterType::Triangle)
    }
}

/// A transform that could not be applied; carries the untouched input frame
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PassThrough {
    pub frame: Frame,
    #[source]
    pub error: AppError,
}

/// Detects regions and composites the substitute image over them
pub struct FrameTransformer {
    detector: Arc<dyn RegionDetector>,
    substitute: SubstituteImage,
}

impl FrameTransformer {
    pub fn new(detector: Arc<dyn RegionDetector>, substitute: SubstituteImage) -> Self {
        Self {
            detector,
            substitute,
        }
    }

    /// Build the detector and substitute image named by `config`
    pub fn from_config(config: &TransformConfig) -> Result<Self> {
        let detector: Arc<dyn RegionDetector> = match config.detector {
            DetectorKind::None => Arc::new(NoDetector),
            DetectorKind::Fixed => Arc::new(FixedRegions::new(config.fixed_regions.clone())),
        };
        let substitute = SubstituteImage::from_config(&config.substitute_image)?;
        Ok(Self::new(detector, substitute))
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    pub fn substitute(&self) -> &SubstituteImage {
        &self.substitute
    }

    /// Transform one BGR24 frame
    ///
    /// On failure the input frame is handed back unmodified inside
    /// [`PassThrough`]; the caller decides whether to emit it.
    pub fn transform(&self, frame: Frame) -> std::result::Result<Frame, PassThrough> {
        if frame.layout() != PixelLayout::Bgr24 {
            let error = AppError::TransformFailure(format!(
                "expected bgr24 input, got {}",
                frame.layout()
            ));
            return Err(PassThrough { frame, error });
        }

        let regions = match self.detector.detect(&frame) {
            Ok(regions) => regions,
            Err(e) => {
                let error = match e {
                    AppError::TransformFailure(_) => e,
                    other => AppError::TransformFailure(other.to_string()),
                };
                return Err(PassThrough { frame, error });
            }
        };

        Ok(self.apply_regions(frame, &regions))
    }

    /// Overwrite each region of a BGR24 frame with the resized substitute
    ///
    /// Regions are clipped to the frame; the substitute is resized to the
    /// region size first, so a clipped region shows the matching top-left
    /// part of it. Each side of that patch is capped at the frame's, which
    /// bounds the allocation whatever size a detector reports.
    pub fn apply_regions(&self, frame: Frame, regions: &[DetectedRegion]) -> Frame {
        if regions.is_empty() {
            return frame;
        }
        if frame.layout() != PixelLayout::Bgr24 {
            tracing::warn!("Cannot composite onto {} frame, leaving it untouched", frame.layout());
            return frame;
        }

        let (fw, fh) = (frame.width(), frame.height());
        let (pts, time_base, layout) = (frame.pts(), frame.time_base(), frame.layout());
        let mut data = frame.into_data();
        let row_bytes = fw as usize * 3;

        for region in regions {
            let Some((vw, vh)) = region.visible_size(fw, fh) else {
                tracing::trace!("Skipping region outside frame: {:?}", region);
                continue;
            };
            let (pw, ph) = (region.width.min(fw), region.height.min(fh));
            let patch = self.substitute.resized(pw, ph);
            let patch_row = pw as usize * 3;
            let copy_len = vw as usize * 3;

            for row in 0..vh as usize {
                let src = row * patch_row;
                let dst = (region.y as usize + row) * row_bytes + region.x as usize * 3;
                data[dst..dst + copy_len].copy_from_slice(&patch.as_raw()[src..src + copy_len]);
            }
        }

        Frame::from_parts(data, fw, fh, layout, pts, time_base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::frame::TimeBase;

    struct FailingDetector;

    impl RegionDetector for FailingDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedRegion>> {
            Err(AppError::TransformFailure("model unavailable".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn gradient_frame(w: u32, h: u32) -> Frame {
        let data = (0..w * h * 3).map(|i| (i % 251) as u8).collect();
        Frame::new(data, w, h, PixelLayout::Bgr24, 7, TimeBase::video()).unwrap()
    }

    fn checker_substitute() -> SubstituteImage {
        let data = (0..8 * 8)
            .flat_map(|i| if (i / 8 + i % 8) % 2 == 0 { [255, 0, 0] } else { [0, 0, 255] })
            .collect();
        SubstituteImage::from_bgr(8, 8, data).unwrap()
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y * frame.width() + x) * 3) as usize;
        [frame.data()[idx], frame.data()[idx + 1], frame.data()[idx + 2]]
    }

    #[test]
    fn test_no_regions_is_identity() {
        let transformer = FrameTransformer::new(Arc::new(NoDetector), checker_substitute());
        let input = gradient_frame(32, 24);
        let output = transformer.transform(input.clone()).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_single_region_only_changes_rectangle() {
        let region = DetectedRegion::new(5, 3, 12, 9);
        let transformer = FrameTransformer::new(
            Arc::new(FixedRegions::new(vec![region])),
            checker_substitute(),
        );
        let input = gradient_frame(32, 24);
        let output = transformer.transform(input.clone()).unwrap();

        let expected = transformer.substitute().resized(12, 9);
        for y in 0..24 {
            for x in 0..32 {
                if region.contains(x, y) {
                    assert_eq!(
                        pixel(&output, x, y),
                        expected.get_pixel(x - region.x, y - region.y).0,
                        "inside at ({}, {})",
                        x,
                        y
                    );
                } else {
                    assert_eq!(pixel(&output, x, y), pixel(&input, x, y), "outside at ({}, {})", x, y);
                }
            }
        }
        assert_eq!(output.pts(), input.pts());
    }

    #[test]
    fn test_overlap_last_region_wins() {
        let red = SubstituteImage::from_bgr(1, 1, vec![0, 0, 255]).unwrap();
        let transformer = FrameTransformer::new(Arc::new(NoDetector), red);
        let first = DetectedRegion::new(0, 0, 4, 4);
        let second = DetectedRegion::new(2, 2, 4, 4);

        let frame = transformer.apply_regions(gradient_frame(8, 8), &[first, second]);
        assert_eq!(pixel(&frame, 3, 3), [0, 0, 255]);
        assert_eq!(pixel(&frame, 0, 0), [0, 0, 255]);
        assert_eq!(pixel(&frame, 7, 7), pixel(&gradient_frame(8, 8), 7, 7));
    }

    #[test]
    fn test_regions_are_clipped_to_frame() {
        let transformer = FrameTransformer::new(Arc::new(NoDetector), checker_substitute());
        let input = gradient_frame(10, 10);
        let regions = [
            DetectedRegion::new(8, 8, 6, 6),
            DetectedRegion::new(20, 0, 4, 4),
            DetectedRegion::new(0, 0, 0, 5),
        ];
        let output = transformer.apply_regions(input.clone(), &regions);

        let patch = transformer.substitute().resized(6, 6);
        assert_eq!(pixel(&output, 9, 9), patch.get_pixel(1, 1).0);
        assert_eq!(pixel(&output, 0, 0), pixel(&input, 0, 0));
        assert_eq!(output.data().len(), input.data().len());
    }

    #[test]
    fn test_oversized_region_is_capped_to_frame() {
        let transformer = FrameTransformer::new(Arc::new(NoDetector), checker_substitute());
        let region = DetectedRegion::new(0, 0, 100_000, 100_000);
        let output = transformer.apply_regions(gradient_frame(10, 6), &[region]);

        let patch = transformer.substitute().resized(10, 6);
        assert_eq!(output.data(), patch.as_raw().as_slice());
    }

    #[test]
    fn test_default_config_builds_transformer() {
        let config = crate::config::AppConfig::default();
        let transformer = FrameTransformer::from_config(&config.transform).unwrap();
        assert_eq!(transformer.detector_name(), "none");
        assert!(transformer.substitute().width() > 0);
        assert!(transformer.substitute().height() > 0);
    }

    #[test]
    fn test_missing_substitute_file_is_config_error() {
        let config = TransformConfig {
            substitute_image: "/nonexistent/substitute.png".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            FrameTransformer::from_config(&config),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_detector_failure_passes_frame_through() {
        let transformer = FrameTransformer::new(Arc::new(FailingDetector), checker_substitute());
        let input = gradient_frame(16, 16);
        let err = transformer.transform(input.clone()).unwrap_err();
        assert!(matches!(err.error, AppError::TransformFailure(_)));
        assert_eq!(err.frame, input);
    }

    #[test]
    fn test_wrong_layout_passes_frame_through() {
        let transformer = FrameTransformer::new(Arc::new(NoDetector), checker_substitute());
        let input = Frame::new(vec![16; 6], 2, 2, PixelLayout::I420, 0, TimeBase::video()).unwrap();
        let err = transformer.transform(input.clone()).unwrap_err();
        assert_eq!(err.frame, input);
    }
}
