//! rollcall-core: Gallery building and nearest-descriptor face matching.
//!
//! The face detector and descriptor model sit behind the [`Embedder`] trait;
//! an ONNX Runtime implementation (SCRFD + ArcFace) is available with the
//! `onnx` feature.

pub mod embedder;
pub mod gallery;
pub mod matcher;
pub mod scale;
pub mod types;

#[cfg(feature = "onnx")]
pub mod onnx;

pub use embedder::{EmbedError, Embedder};
pub use gallery::{FailurePolicy, Gallery, GalleryBuilder, GalleryError};
pub use matcher::{nearest, FrameMatcher, InvalidThreshold, Threshold};
pub use scale::{Downscale, FrameScale, InvalidDownscale};
pub use types::{Descriptor, DetectedFace, FaceBox, GalleryEntry, MatchResult, Nearest};
