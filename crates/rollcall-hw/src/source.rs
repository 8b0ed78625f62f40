//! Frame source boundary and a directory replay implementation.

use crate::frame::Frame;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameSourceError {
    /// The stream has ended; no further frames will arrive.
    #[error("frame source exhausted")]
    Exhausted,
    /// This frame was lost; the next call may succeed.
    #[error("transient capture failure: {0}")]
    Transient(String),
    /// The source can never produce frames again (device gone, unreadable input).
    #[error("frame source failed: {0}")]
    Fatal(String),
}

impl FrameSourceError {
    /// Whether the source must not be polled again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FrameSourceError::Transient(_))
    }
}

/// Lazy, non-restartable sequence of frames.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, FrameSourceError>;

    /// Release the underlying device or handle. Called once when the pipeline stops.
    fn release(&mut self) {}

    /// Short human-readable identifier for logs.
    fn describe(&self) -> String;

    /// Whether frames arrive in real time. A live source never waits for the
    /// consumer, so stale frames are dropped; a replayed one is paced by it.
    fn is_live(&self) -> bool {
        true
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Frame, FrameSourceError> {
        (**self).next_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn is_live(&self) -> bool {
        (**self).is_live()
    }
}

/// Replays the image files of a directory as frames, in file-name order.
///
/// A file that fails to decode is reported as a transient failure so the
/// pipeline skips it; the end of the listing is [`FrameSourceError::Exhausted`].
pub struct DirectorySource {
    dir: PathBuf,
    pending: std::vec::IntoIter<PathBuf>,
    sequence: u64,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> Result<Self, FrameSourceError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| FrameSourceError::Fatal(format!("{}: {e}", dir.display())))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && ImageFormat::from_path(p).is_ok())
            .collect();
        files.sort();

        tracing::info!(dir = %dir.display(), frames = files.len(), "opened frame directory");
        Ok(Self {
            dir: dir.to_path_buf(),
            pending: files.into_iter(),
            sequence: 0,
        })
    }

    /// Frames not yet replayed.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Result<Frame, FrameSourceError> {
        let path = self.pending.next().ok_or(FrameSourceError::Exhausted)?;
        let sequence = self.sequence;
        self.sequence += 1;

        let image = image::open(&path)
            .map_err(|e| FrameSourceError::Transient(format!("{}: {e}", path.display())))?;
        Ok(Frame::new(image.to_rgb8(), sequence))
    }

    fn release(&mut self) {
        let dropped = self.pending.len();
        self.pending = Vec::new().into_iter();
        tracing::debug!(dir = %self.dir.display(), dropped, "frame directory released");
    }

    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }

    fn is_live(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rollcall-frames-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_replays_in_name_order_then_exhausts() {
        let dir = scratch_dir();
        RgbImage::from_pixel(4, 2, Rgb([2, 2, 2])).save(dir.join("frame-002.png")).unwrap();
        RgbImage::from_pixel(4, 2, Rgb([1, 1, 1])).save(dir.join("frame-001.png")).unwrap();

        let mut source = DirectorySource::open(&dir).unwrap();
        assert_eq!(source.remaining(), 2);
        assert!(!source.is_live());

        let first = source.next_frame().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.image.get_pixel(0, 0), &Rgb([1, 1, 1]));
        let second = source.next_frame().unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(second.image.get_pixel(0, 0), &Rgb([2, 2, 2]));

        assert!(matches!(source.next_frame(), Err(FrameSourceError::Exhausted)));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_corrupt_file_is_transient() {
        let dir = scratch_dir();
        std::fs::write(dir.join("a.jpg"), b"garbage").unwrap();
        RgbImage::new(2, 2).save(dir.join("b.png")).unwrap();

        let mut source = DirectorySource::open(&dir).unwrap();
        let err = source.next_frame().unwrap_err();
        assert!(!err.is_terminal());
        assert_eq!(source.next_frame().unwrap().sequence, 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_release_drops_pending() {
        let dir = scratch_dir();
        RgbImage::new(2, 2).save(dir.join("a.png")).unwrap();
        let mut source = DirectorySource::open(&dir).unwrap();
        source.release();
        assert!(matches!(source.next_frame(), Err(FrameSourceError::Exhausted)));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let err = DirectorySource::open(Path::new("/nonexistent/rollcall/frames")).err().unwrap();
        assert!(err.is_terminal());
    }
}
