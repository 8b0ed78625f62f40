//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{FrameSource, FrameSourceError};
use image::ImageFormat;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Frame request; the driver may negotiate something else.
const REQUEST_WIDTH: u32 = 640;
const REQUEST_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// Upper bound on one dequeue so a stalled device cannot block shutdown.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(2);
const EBUSY: i32 = 16;
/// The device disappeared (unplugged).
const ENODEV: i32 = 19;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("video capture not supported")]
    CaptureNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, 2 bytes/pixel.
    Yuyv,
    /// Packed RGB, 3 bytes/pixel.
    Rgb3,
    /// Packed BGR, 3 bytes/pixel.
    Bgr3,
    /// Motion JPEG, one JPEG image per buffer.
    Mjpg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"RGB3" => Some(Self::Rgb3),
            b"BGR3" => Some(Self::Bgr3),
            b"MJPG" => Some(Self::Mjpg),
            _ => None,
        }
    }
}

/// V4L2 camera as a [`FrameSource`].
pub struct Camera {
    // Declared before the device so streaming stops before the handle closes.
    stream: Option<MmapStream<'static>>,
    _device: Device,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    sequence: u64,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(EBUSY) || e.to_string().contains("busy") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::CaptureNotSupported);
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUEST_WIDTH;
        fmt.height = REQUEST_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {:?} (need YUYV, RGB3, BGR3 or MJPG)",
                negotiated.fourcc
            ))
        })?;
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "negotiated format"
        );

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        Ok(Self {
            stream: Some(stream),
            _device: device,
            device_path: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
            sequence: 0,
        })
    }

    /// Convert a raw buffer to RGB based on the negotiated format.
    fn decode(&self, buf: &[u8]) -> Result<image::RgbImage, String> {
        match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height).map_err(|e| e.to_string()),
            PixelFormat::Rgb3 => frame::packed_rgb(buf, self.width, self.height).map_err(|e| e.to_string()),
            PixelFormat::Bgr3 => {
                let mut img = frame::packed_rgb(buf, self.width, self.height).map_err(|e| e.to_string())?;
                frame::swap_red_blue(&mut img);
                Ok(img)
            }
            PixelFormat::Mjpg => image::load_from_memory_with_format(buf, ImageFormat::Jpeg)
                .map(|img| img.to_rgb8())
                .map_err(|e| format!("MJPG decode failed: {e}")),
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }
        devices
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, FrameSourceError> {
        let stream = self.stream.as_mut().ok_or(FrameSourceError::Exhausted)?;
        let (buf, meta) = stream.next().map_err(classify)?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };

        // Copy out before decoding so the stream borrow ends.
        let data = data.to_vec();
        let image = self.decode(&data).map_err(FrameSourceError::Transient)?;
        let sequence = self.sequence;
        self.sequence += 1;
        Ok(Frame::new(image, sequence))
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!(device = %self.device_path, "camera released");
        }
    }

    fn describe(&self) -> String {
        format!("camera {}", self.device_path)
    }
}

fn classify(err: io::Error) -> FrameSourceError {
    if err.raw_os_error() == Some(ENODEV) {
        FrameSourceError::Fatal(format!("device disconnected: {err}"))
    } else {
        FrameSourceError::Transient(format!("failed to dequeue buffer: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), None);
    }

    #[test]
    fn test_classify_errors() {
        assert!(classify(io::Error::from_raw_os_error(ENODEV)).is_terminal());
        assert!(!classify(io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF")).is_terminal());
    }

    #[test]
    fn test_open_missing_device() {
        assert!(matches!(
            Camera::open("/dev/video-rollcall-missing"),
            Err(CameraError::DeviceNotFound(_))
        ));
    }
}
