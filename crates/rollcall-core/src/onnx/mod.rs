//! ONNX Runtime embedder: SCRFD detection + ArcFace descriptors.

pub mod alignment;
pub mod detector;
pub mod recognizer;

use crate::embedder::{EmbedError, Embedder};
use crate::types::DetectedFace;
use detector::FaceDetector;
use image::RgbImage;
use recognizer::FaceRecognizer;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("model file not found: {0}; download from insightface and place it in the model directory")]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// [`Embedder`] backed by the insightface SCRFD and ArcFace ONNX models.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, OnnxError> {
        Ok(Self {
            detector: FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?,
            recognizer: FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?,
        })
    }
}

impl Embedder for OnnxEmbedder {
    /// Faces come back highest detection score first.
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EmbedError> {
        let detections = self
            .detector
            .detect(image)
            .map_err(|e| EmbedError::Detection(e.to_string()))?;

        let mut faces = Vec::with_capacity(detections.len());
        for det in detections {
            let crop = match &det.landmarks {
                Some(lms) => alignment::align(image, lms),
                None => alignment::crop_resize(image, &det.bbox),
            };
            let Some(crop) = crop else {
                tracing::debug!(bbox = ?det.bbox, "face could not be aligned; dropped");
                continue;
            };
            let descriptor = self
                .recognizer
                .describe(&crop)
                .map_err(|e| EmbedError::Encoding(e.to_string()))?;
            faces.push(DetectedFace {
                bbox: det.bbox,
                descriptor,
            });
        }
        Ok(faces)
    }
}
