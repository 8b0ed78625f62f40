//! Boundary to the face detection / descriptor model.

use crate::matcher::Threshold;
use crate::types::{Descriptor, DetectedFace};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("face detection failed: {0}")]
    Detection(String),
    #[error("descriptor extraction failed: {0}")]
    Encoding(String),
    #[error("image rejected by embedder: {0}")]
    UnsupportedImage(String),
}

/// Face localisation and descriptor extraction.
///
/// Images are RGB. Boxes returned by [`detect_and_encode`](Self::detect_and_encode)
/// are in the pixel coordinates of the image that was passed in. Faces are
/// returned in the embedder's canonical order; the gallery builder relies on
/// that order being stable for the same input.
pub trait Embedder {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EmbedError>;

    /// Descriptors for a reference image, in the same order as detection.
    fn encode_known(&mut self, image: &RgbImage) -> Result<Vec<Descriptor>, EmbedError> {
        Ok(self
            .detect_and_encode(image)?
            .into_iter()
            .map(|face| face.descriptor)
            .collect())
    }

    fn distance(&self, a: &Descriptor, b: &Descriptor) -> f32 {
        a.euclidean_distance(b)
    }

    fn is_match(&self, known: &Descriptor, probe: &Descriptor, threshold: Threshold) -> bool {
        self.distance(known, probe) <= threshold.get()
    }
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, EmbedError> {
        (**self).detect_and_encode(image)
    }

    fn encode_known(&mut self, image: &RgbImage) -> Result<Vec<Descriptor>, EmbedError> {
        (**self).encode_known(image)
    }

    fn distance(&self, a: &Descriptor, b: &Descriptor) -> f32 {
        (**self).distance(a, b)
    }

    fn is_match(&self, known: &Descriptor, probe: &Descriptor, threshold: Threshold) -> bool {
        (**self).is_match(known, probe, threshold)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{face, ScriptedEmbedder};
    use super::*;

    #[test]
    fn test_encode_known_keeps_detection_order() {
        let mut embedder = ScriptedEmbedder::default();
        embedder.push_faces(vec![face(&[1.0, 0.0]), face(&[0.0, 1.0])]);

        let descriptors = embedder.encode_known(&RgbImage::new(4, 4)).unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].values(), &[1.0, 0.0]);
        assert_eq!(descriptors[1].values(), &[0.0, 1.0]);
    }

    #[test]
    fn test_default_is_match_is_inclusive() {
        let embedder = ScriptedEmbedder::default();
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![0.6, 0.0]);
        let threshold = Threshold::new(0.6).unwrap();
        assert!(embedder.is_match(&a, &b, threshold));
        assert!(!embedder.is_match(&a, &Descriptor::new(vec![0.61, 0.0]), threshold));
    }

    #[test]
    fn test_boxed_embedder_forwards() {
        let mut inner = ScriptedEmbedder::default();
        inner.push_faces(vec![face(&[2.0])]);
        let mut boxed: Box<dyn Embedder> = Box::new(inner);
        let faces = boxed.detect_and_encode(&RgbImage::new(2, 2)).unwrap();
        assert_eq!(faces.len(), 1);
        assert!((boxed.distance(&faces[0].descriptor, &Descriptor::new(vec![0.0])) - 2.0).abs() < 1e-6);
    }
}
