//! ArcFace descriptor extraction via ONNX Runtime.

use super::alignment::ALIGNED_SIZE;
use super::OnnxError;
use crate::types::Descriptor;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5; // symmetric, unlike SCRFD
const DESCRIPTOR_DIM: usize = 512;

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, OnnxError> {
        if !model_path.exists() {
            return Err(OnnxError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "loaded ArcFace recognizer");

        Ok(Self { session })
    }

    /// L2-normalised descriptor for an aligned 112×112 RGB face crop.
    pub fn describe(&mut self, aligned: &RgbImage) -> Result<Descriptor, OnnxError> {
        let input = preprocess(aligned)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OnnxError::Inference(format!("descriptor output: {e}")))?;
        if raw.len() != DESCRIPTOR_DIM {
            return Err(OnnxError::Inference(format!(
                "expected {DESCRIPTOR_DIM}-dim descriptor, got {}",
                raw.len()
            )));
        }

        Ok(Descriptor::new(l2_normalize(raw)))
    }
}

fn preprocess(aligned: &RgbImage) -> Result<Array4<f32>, OnnxError> {
    let side = ALIGNED_SIZE as usize;
    if aligned.dimensions() != (ALIGNED_SIZE, ALIGNED_SIZE) {
        return Err(OnnxError::Inference(format!(
            "aligned crop must be {side}x{side}, got {:?}",
            aligned.dimensions()
        )));
    }

    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - PIXEL_MEAN) / PIXEL_STD;
        }
    }
    Ok(tensor)
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_shape_and_channels() {
        let crop = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, image::Rgb([255, 127, 0]));
        let t = preprocess(&crop).unwrap();
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        assert!((t[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 5, 5]] - (127.0 - 127.5) / 127.5).abs() < 1e-6);
        assert!((t[[0, 2, 5, 5]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_rejects_wrong_size() {
        assert!(preprocess(&RgbImage::new(64, 64)).is_err());
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
