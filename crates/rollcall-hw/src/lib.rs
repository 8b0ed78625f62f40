//! rollcall-hw: Frame acquisition for the matching loop.
//!
//! Provides the [`FrameSource`] boundary, a directory replay source, pixel
//! format conversion, and (with the `v4l` feature) V4L2 camera capture.

#[cfg(feature = "v4l")]
pub mod camera;
pub mod frame;
pub mod source;

#[cfg(feature = "v4l")]
pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{DirectorySource, FrameSource, FrameSourceError};
