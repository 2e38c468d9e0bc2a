//! Overlay compositor.
//!
//! One placement rule is shared by the client-side recomposer and the
//! server-side transcoder: the overlay is scaled to a fraction of the target
//! width, keeps its aspect ratio, and sits in the top-right corner with a
//! fixed margin.

use std::path::PathBuf;

use image::imageops::{self, FilterType};
use image::RgbaImage;

use synthcast_common::config::OverlayConfig;
use synthcast_common::error::{ClipError, ClipResult};

/// Where and how large the overlay is drawn on a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayPlacement {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl OverlayPlacement {
    /// Placement of an `overlay_width` x `overlay_height` image on a frame
    /// `target_width` pixels wide.
    pub fn compute(
        target_width: u32,
        overlay_width: u32,
        overlay_height: u32,
        config: &OverlayConfig,
    ) -> Self {
        let width = ((target_width as f64 * config.width_fraction).round() as u32).max(1);
        let height = if overlay_width == 0 {
            width
        } else {
            ((width as f64 * overlay_height as f64 / overlay_width as f64).round() as u32).max(1)
        };
        Self {
            x: target_width.saturating_sub(width.saturating_add(config.margin_px)),
            y: config.margin_px,
            width,
            height,
        }
    }

    /// Width the overlay is scaled to on a frame of the given width, without
    /// knowing the overlay's own size.
    pub fn scaled_width(target_width: u32, config: &OverlayConfig) -> u32 {
        Self::compute(target_width, 1, 1, config).width
    }

    pub fn contains(&self, px: u32, py: u32) -> bool {
        px >= self.x && px < self.x + self.width && py >= self.y && py < self.y + self.height
    }
}

/// A decoded overlay bitmap. Loaded once per compose call.
#[derive(Debug, Clone)]
pub struct OverlayImage {
    image: RgbaImage,
}

impl OverlayImage {
    /// Wrap a decoded bitmap. Zero-sized images are rejected.
    pub fn new(image: RgbaImage) -> ClipResult<Self> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ClipError::decode("Overlay image has zero size"));
        }
        Ok(Self { image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn placement(&self, target_width: u32, config: &OverlayConfig) -> OverlayPlacement {
        OverlayPlacement::compute(target_width, self.width(), self.height(), config)
    }

    /// The overlay resized for a placement.
    pub fn scaled(&self, placement: &OverlayPlacement) -> RgbaImage {
        if placement.width == self.width() && placement.height == self.height() {
            return self.image.clone();
        }
        imageops::resize(
            &self.image,
            placement.width,
            placement.height,
            FilterType::Triangle,
        )
    }
}

/// Where an overlay comes from.
#[derive(Debug, Clone)]
pub enum OverlaySource {
    /// An image file on disk.
    Path(PathBuf),
    /// Encoded image bytes (PNG, JPEG).
    Encoded(Vec<u8>),
    /// An already decoded bitmap.
    Decoded(RgbaImage),
}

impl OverlaySource {
    /// Decode the overlay.
    pub fn load(&self) -> ClipResult<OverlayImage> {
        let image = match self {
            OverlaySource::Path(path) => {
                if !path.exists() {
                    return Err(ClipError::FileNotFound { path: path.clone() });
                }
                image::open(path)
                    .map_err(|e| {
                        ClipError::decode(format!(
                            "Failed to decode overlay {}: {e}",
                            path.display()
                        ))
                    })?
                    .to_rgba8()
            }
            OverlaySource::Encoded(bytes) => image::load_from_memory(bytes)
                .map_err(|e| ClipError::decode(format!("Failed to decode overlay: {e}")))?
                .to_rgba8(),
            OverlaySource::Decoded(image) => image.clone(),
        };
        OverlayImage::new(image)
    }
}

/// Draws one pre-scaled overlay onto frames of a fixed width.
#[derive(Debug, Clone)]
pub struct FrameCompositor {
    placement: OverlayPlacement,
    scaled: RgbaImage,
}

impl FrameCompositor {
    pub fn new(overlay: &OverlayImage, target_width: u32, config: &OverlayConfig) -> Self {
        let placement = overlay.placement(target_width, config);
        let scaled = overlay.scaled(&placement);
        Self { placement, scaled }
    }

    pub fn placement(&self) -> OverlayPlacement {
        self.placement
    }

    /// Draw the overlay in place; parts outside the frame are clipped.
    pub fn apply(&self, frame: &mut RgbaImage) {
        imageops::overlay(
            frame,
            &self.scaled,
            self.placement.x as i64,
            self.placement.y as i64,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use proptest::prelude::*;

    fn defaults() -> OverlayConfig {
        OverlayConfig::default()
    }

    #[test]
    fn test_placement_on_640_wide_frame() {
        let placement = OverlayPlacement::compute(640, 64, 64, &defaults());
        assert_eq!(
            placement,
            OverlayPlacement {
                x: 524,
                y: 20,
                width: 96,
                height: 96
            }
        );
    }

    #[test]
    fn test_canonical_width_gives_162px() {
        assert_eq!(OverlayPlacement::scaled_width(1080, &defaults()), 162);
    }

    #[test]
    fn test_placement_keeps_aspect_ratio() {
        let placement = OverlayPlacement::compute(1280, 400, 100, &defaults());
        assert_eq!(placement.width, 192);
        assert_eq!(placement.height, 48);
        assert_eq!(placement.x, 1280 - 192 - 20);
    }

    #[test]
    fn test_zero_sized_overlay_rejected() {
        let result = OverlayImage::new(RgbaImage::new(0, 10));
        assert!(matches!(result, Err(ClipError::DecodeFailure { .. })));
    }

    #[test]
    fn test_garbage_bytes_do_not_decode() {
        let source = OverlaySource::Encoded(vec![0, 1, 2, 3]);
        assert!(source.load().is_err());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let source = OverlaySource::Path(PathBuf::from("/nonexistent/overlay.png"));
        assert!(matches!(source.load(), Err(ClipError::FileNotFound { .. })));
    }

    #[test]
    fn test_apply_paints_top_right_box() {
        let overlay =
            OverlayImage::new(RgbaImage::from_pixel(32, 32, Rgba([255, 0, 0, 255]))).unwrap();
        let compositor = FrameCompositor::new(&overlay, 200, &defaults());
        let mut frame = RgbaImage::from_pixel(200, 100, Rgba([0, 0, 255, 255]));
        compositor.apply(&mut frame);

        let p = compositor.placement();
        assert_eq!((p.x, p.y, p.width, p.height), (150, 20, 30, 30));
        assert_eq!(frame.get_pixel(p.x + 1, p.y + 1), &Rgba([255, 0, 0, 255]));
        assert_eq!(frame.get_pixel(p.x - 1, p.y), &Rgba([0, 0, 255, 255]));
        assert_eq!(frame.get_pixel(199, 99), &Rgba([0, 0, 255, 255]));
    }

    proptest! {
        #[test]
        fn prop_placement_hugs_top_right(
            target in 200u32..4000,
            ow in 1u32..2000,
            oh in 1u32..2000,
        ) {
            let config = defaults();
            let p = OverlayPlacement::compute(target, ow, oh, &config);
            prop_assert_eq!(p.y, config.margin_px);
            prop_assert_eq!(p.x + p.width + config.margin_px, target);
            let expected_w = (target as f64 * config.width_fraction).round() as u32;
            prop_assert_eq!(p.width, expected_w.max(1));
            let expected_h = p.width as f64 * oh as f64 / ow as f64;
            prop_assert!((p.height as f64 - expected_h.max(1.0)).abs() <= 1.0);
        }
    }
}
