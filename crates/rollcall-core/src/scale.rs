//! Frame downscaling ahead of detection, and mapping boxes back up.

use image::imageops::{self, FilterType};
use image::RgbImage;
use std::borrow::Cow;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("downscale factor must be in (0, 1], got {0}")]
pub struct InvalidDownscale(pub f32);

/// Per-axis downscale factor applied before detection (0.25 = quarter size).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Downscale(f32);

impl Downscale {
    pub const NONE: Downscale = Downscale(1.0);

    pub fn new(factor: f32) -> Result<Self, InvalidDownscale> {
        if factor.is_finite() && factor > 0.0 && factor <= 1.0 {
            Ok(Self(factor))
        } else {
            Err(InvalidDownscale(factor))
        }
    }

    pub fn factor(&self) -> f32 {
        self.0
    }

    /// Target size for a `width`×`height` frame, never below 1×1.
    pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        let scale = |v: u32| ((v as f32 * self.0).round() as u32).max(1);
        (scale(width), scale(height))
    }

    /// Downscale a frame, returning it with the factors that map boxes back.
    ///
    /// The inverse factors come from the actual resized dimensions, so boxes
    /// land in original coordinates even when `size * factor` is not integral.
    pub fn apply<'a>(&self, frame: &'a RgbImage) -> (Cow<'a, RgbImage>, FrameScale) {
        let (width, height) = frame.dimensions();
        let (small_w, small_h) = self.target_size(width, height);
        if (small_w, small_h) == (width, height) {
            return (Cow::Borrowed(frame), FrameScale::IDENTITY);
        }

        let small = imageops::resize(frame, small_w, small_h, FilterType::Triangle);
        let scale = FrameScale {
            sx: width as f32 / small_w as f32,
            sy: height as f32 / small_h as f32,
        };
        (Cow::Owned(small), scale)
    }
}

/// Factors mapping downscaled-frame coordinates to original-frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameScale {
    pub sx: f32,
    pub sy: f32,
}

impl FrameScale {
    pub const IDENTITY: FrameScale = FrameScale { sx: 1.0, sy: 1.0 };
}
