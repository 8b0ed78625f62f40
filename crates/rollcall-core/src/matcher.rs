//! Nearest-descriptor matching of detected faces against the gallery.

use crate::embedder::{EmbedError, Embedder};
use crate::gallery::Gallery;
use crate::scale::Downscale;
use crate::types::{Descriptor, DetectedFace, MatchResult, Nearest};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("distance threshold must be a finite value greater than zero, got {0}")]
pub struct InvalidThreshold(pub f32);

/// Maximum descriptor distance at which two faces count as the same identity.
///
/// No default: the right value depends on the embedder's descriptor
/// distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold(f32);

impl Threshold {
    pub fn new(value: f32) -> Result<Self, InvalidThreshold> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(InvalidThreshold(value))
        }
    }

    pub fn get(&self) -> f32 {
        self.0
    }
}

/// Index and distance of the gallery entry closest to `probe`.
///
/// Every entry is visited. Ties resolve to the lowest index and NaN
/// distances never win. Returns `None` for an empty gallery.
pub fn nearest<E: Embedder + ?Sized>(
    embedder: &E,
    probe: &Descriptor,
    gallery: &Gallery,
) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (i, entry) in gallery.entries().iter().enumerate() {
        let d = embedder.distance(&entry.descriptor, probe);
        if d.is_nan() {
            continue;
        }
        match best {
            Some((_, best_d)) if d >= best_d => {}
            _ => best = Some((i, d)),
        }
    }
    best
}

/// Per-frame matcher: downscale, detect, then match every face independently.
#[derive(Debug, Clone, Copy)]
pub struct FrameMatcher {
    threshold: Threshold,
    downscale: Downscale,
}

impl FrameMatcher {
    pub fn new(threshold: Threshold, downscale: Downscale) -> Self {
        Self { threshold, downscale }
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    pub fn downscale(&self) -> Downscale {
        self.downscale
    }

    /// Match one face. The nearest entry must also pass the embedder's
    /// `is_match` test to be accepted.
    pub fn match_face<E: Embedder + ?Sized>(
        &self,
        embedder: &E,
        face: DetectedFace,
        gallery: &Gallery,
    ) -> MatchResult {
        match nearest(embedder, &face.descriptor, gallery) {
            Some((index, distance)) => {
                let entry = &gallery.entries()[index];
                let accepted = embedder.is_match(&entry.descriptor, &face.descriptor, self.threshold);
                MatchResult {
                    nearest: Some(Nearest { index, label: entry.label.clone() }),
                    distance,
                    accepted,
                    face,
                }
            }
            None => MatchResult {
                face,
                nearest: None,
                distance: f32::INFINITY,
                accepted: false,
            },
        }
    }

    /// Detect and match every face in `frame`.
    ///
    /// Detection runs on the downscaled frame; the returned boxes are in
    /// original-frame coordinates. A frame without faces yields an empty vec.
    pub fn match_frame<E: Embedder + ?Sized>(
        &self,
        embedder: &mut E,
        frame: &RgbImage,
        gallery: &Gallery,
    ) -> Result<Vec<MatchResult>, EmbedError> {
        let (small, scale) = self.downscale.apply(frame);
        let faces = embedder.detect_and_encode(&small)?;

        let results: Vec<MatchResult> = faces
            .into_iter()
            .map(|mut face| {
                face.bbox = face.bbox.scaled(scale.sx, scale.sy);
                self.match_face(&*embedder, face, gallery)
            })
            .collect();

        tracing::debug!(
            faces = results.len(),
            accepted = results.iter().filter(|r| r.accepted).count(),
            "frame matched"
        );
        Ok(results)
    }
}
