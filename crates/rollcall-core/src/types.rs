use serde::{Deserialize, Serialize};

/// Face location in frame pixel coordinates.
///
/// Coordinates are kept as floats so a box reported on a downscaled frame
/// can be mapped back to the original frame without compounding rounding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl FaceBox {
    pub fn new(top: f32, right: f32, bottom: f32, left: f32) -> Self {
        Self { top, right, bottom, left }
    }

    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Scale horizontal coordinates by `sx` and vertical ones by `sy`.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            top: self.top * sy,
            right: self.right * sx,
            bottom: self.bottom * sy,
            left: self.left * sx,
        }
    }

    /// Intersection-over-union with another box, 0.0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &FaceBox) -> f32 {
        let inter = FaceBox {
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
            left: self.left.max(other.left),
        };
        let inter_area = inter.area();
        let union_area = self.area() + other.area() - inter_area;
        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }

    /// Round to whole pixels as `(top, right, bottom, left)`.
    pub fn to_pixels(&self) -> (i32, i32, i32, i32) {
        (
            self.top.round() as i32,
            self.right.round() as i32,
            self.bottom.round() as i32,
            self.left.round() as i32,
        )
    }
}

/// Fixed-length face descriptor produced by an embedder.
///
/// Immutable once built; two descriptors are only ever compared through a
/// distance metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Dimensionality of the descriptor.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance to another descriptor.
    ///
    /// Descriptors of different dimensionality are infinitely far apart.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// A known identity in the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub label: String,
    pub descriptor: Descriptor,
}

/// A face found in one frame. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: FaceBox,
    pub descriptor: Descriptor,
}

/// The gallery entry closest to a probe descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Nearest {
    /// Position of the entry in the gallery.
    pub index: usize,
    pub label: String,
}

/// Outcome of matching one detected face against the gallery.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub face: DetectedFace,
    /// Nearest entry, `None` only when the gallery is empty.
    pub nearest: Option<Nearest>,
    /// Distance to the nearest entry; infinite when the gallery is empty.
    pub distance: f32,
    pub accepted: bool,
}

impl MatchResult {
    /// Label of the matched identity if the match was accepted.
    pub fn accepted_label(&self) -> Option<&str> {
        match &self.nearest {
            Some(n) if self.accepted => Some(n.label.as_str()),
            _ => None,
        }
    }
}
