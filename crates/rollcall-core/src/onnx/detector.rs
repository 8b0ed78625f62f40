//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over strides 8/16/32 followed by NMS. Input frames
//! are RGB and letterboxed into the square model input.

use super::OnnxError;
use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Five facial landmarks: eyes, nose tip, mouth corners.
pub type Landmarks = [(f32, f32); 5];

/// A raw detection in frame coordinates.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: FaceBox,
    pub score: f32,
    pub landmarks: Option<Landmarks>,
}

/// Maps letterboxed model coordinates back to frame coordinates.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn for_frame(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let (new_w, new_h) = Self::fitted(width, height, scale);
        Self {
            scale,
            pad_x: ((INPUT_SIZE - new_w) / 2) as f32,
            pad_y: ((INPUT_SIZE - new_h) / 2) as f32,
        }
    }

    fn fitted(width: u32, height: u32, scale: f32) -> (u32, u32) {
        let fit = |v: u32| ((v as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        (fit(width), fit(height))
    }

    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions `(score, bbox, kps)` for one stride.
type StrideOutputs = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, OnnxError> {
        if !model_path.exists() {
            return Err(OnnxError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(OnnxError::Inference(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let outputs = output_layout(&names);
        tracing::info!(path = %model_path.display(), ?outputs, "loaded SCRFD detector");

        Ok(Self { session, outputs })
    }

    /// Detect faces, highest score first.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, OnnxError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        let letterbox = Letterbox::for_frame(width, height);
        let input = preprocess(frame, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.outputs[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| OnnxError::Inference(format!("{what} at stride {stride}: {e}")))
            };
            let grid = StrideGrid {
                stride,
                scores: extract(score_idx, "scores")?,
                boxes: extract(bbox_idx, "boxes")?,
                kps: extract(kps_idx, "landmarks")?,
            };
            candidates.extend(grid.decode(&letterbox));
        }

        Ok(suppress(candidates))
    }
}

/// Letterbox an RGB frame into a normalised NCHW tensor. Padding uses the
/// mean so it normalises to zero.
fn preprocess(frame: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
    let (width, height) = frame.dimensions();
    let (new_w, new_h) = Letterbox::fitted(width, height, letterbox.scale);
    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let side = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    let (off_x, off_y) = (letterbox.pad_x as u32, letterbox.pad_y as u32);

    for y in 0..INPUT_SIZE {
        for x in 0..INPUT_SIZE {
            let inside = x >= off_x && x < off_x + new_w && y >= off_y && y < off_y + new_h;
            for c in 0..3 {
                let value = if inside {
                    resized.get_pixel(x - off_x, y - off_y)[c] as f32
                } else {
                    PIXEL_MEAN
                };
                tensor[[0, c, y as usize, x as usize]] = (value - PIXEL_MEAN) / PIXEL_STD;
            }
        }
    }
    tensor
}

/// Named outputs (`score_8`, `bbox_16`, `kps_32`, ...) when available,
/// otherwise the usual positional export order.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let find = |kind: &str, stride: usize| names.iter().position(|n| *n == format!("{kind}_{stride}"));

    let mut layout = [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
    for (slot, &stride) in STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => layout[slot] = (s, b, k),
            _ => {
                tracing::debug!(?names, "SCRFD outputs not named by stride; using positional layout");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    layout
}

/// Raw per-anchor outputs for one stride level.
struct StrideGrid<'a> {
    stride: usize,
    scores: &'a [f32],
    boxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideGrid<'_> {
    fn decode(&self, letterbox: &Letterbox) -> Vec<Detection> {
        let cols = INPUT_SIZE as usize / self.stride;
        let rows = INPUT_SIZE as usize / self.stride;
        let s = self.stride as f32;

        (0..rows * cols * ANCHORS_PER_CELL)
            .filter_map(|anchor| {
                let score = *self.scores.get(anchor)?;
                if score <= SCORE_THRESHOLD {
                    return None;
                }
                let cell = anchor / ANCHORS_PER_CELL;
                let cx = (cell % cols) as f32 * s;
                let cy = (cell / cols) as f32 * s;

                let d = self.boxes.get(anchor * 4..anchor * 4 + 4)?;
                let (left, top) = letterbox.unmap(cx - d[0] * s, cy - d[1] * s);
                let (right, bottom) = letterbox.unmap(cx + d[2] * s, cy + d[3] * s);

                let landmarks = self.kps.get(anchor * 10..anchor * 10 + 10).map(|k| {
                    std::array::from_fn(|i| letterbox.unmap(cx + k[2 * i] * s, cy + k[2 * i + 1] * s))
                });

                Some(Detection {
                    bbox: FaceBox::new(top, right, bottom, left),
                    score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression; the result is sorted by score, descending.
fn suppress(mut candidates: Vec<Detection>) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::new();
    for c in candidates {
        if kept.iter().all(|k| k.bbox.iou(&c.bbox) <= NMS_IOU) {
            kept.push(c);
        }
    }
    kept
}
