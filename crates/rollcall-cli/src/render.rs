//! Annotated output of matched frames.
//!
//! Renderers run on their own thread behind a one-slot channel. When the
//! renderer is still busy with the previous frame the new one is skipped, so
//! slow output never holds up matching.

use image::{Rgb, RgbImage};
use rollcall_core::{FaceBox, MatchResult};
use rollcall_hw::Frame;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tokio::sync::mpsc;

const ACCEPTED_COLOUR: Rgb<u8> = Rgb([0, 200, 0]);
const REJECTED_COLOUR: Rgb<u8> = Rgb([220, 0, 0]);
const OUTLINE_WIDTH: i32 = 2;
/// Height of the filled name band along the bottom edge of a box.
const BAND_HEIGHT: i32 = 35;

/// One face to draw: its box in frame coordinates and the identity shown.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub bbox: FaceBox,
    /// Accepted identity, `None` for an unknown face.
    pub label: Option<String>,
    pub distance: f32,
}

impl Annotation {
    pub fn from_match(result: &MatchResult, label: Option<String>) -> Self {
        Self {
            bbox: result.face.bbox,
            label,
            distance: result.distance,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.label.is_some()
    }
}

pub trait Renderer: Send {
    fn annotate(&mut self, frame: &Frame, annotations: &[Annotation]);
}

/// Logs each annotated frame at debug level.
pub struct TracingRenderer;

impl Renderer for TracingRenderer {
    fn annotate(&mut self, frame: &Frame, annotations: &[Annotation]) {
        for a in annotations {
            let (top, right, bottom, left) = a.bbox.to_pixels();
            tracing::debug!(
                sequence = frame.sequence,
                label = a.label.as_deref().unwrap_or("unknown"),
                distance = a.distance,
                top,
                right,
                bottom,
                left,
                "face"
            );
        }
    }
}

/// Writes a PNG for every frame holding an accepted identity. Each face gets
/// an outline and a filled name band; the label text itself goes to the log.
pub struct SnapshotRenderer {
    dir: PathBuf,
    written: u64,
}

impl SnapshotRenderer {
    pub fn new(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            written: 0,
        })
    }
}

impl Renderer for SnapshotRenderer {
    fn annotate(&mut self, frame: &Frame, annotations: &[Annotation]) {
        if !annotations.iter().any(Annotation::is_accepted) {
            return;
        }
        let mut image = frame.image.clone();
        for a in annotations {
            let colour = if a.is_accepted() { ACCEPTED_COLOUR } else { REJECTED_COLOUR };
            draw_outline(&mut image, &a.bbox, colour);
            draw_band(&mut image, &a.bbox, colour);
        }

        let path = self.dir.join(format!("frame-{:08}.png", frame.sequence));
        match image.save(&path) {
            Ok(()) => {
                self.written += 1;
                let labels: Vec<&str> = annotations.iter().filter_map(|a| a.label.as_deref()).collect();
                tracing::debug!(path = %path.display(), written = self.written, ?labels, "snapshot written");
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to write snapshot"),
        }
    }
}

/// Hollow rectangle, clipped to the image.
fn draw_outline(image: &mut RgbImage, bbox: &FaceBox, colour: Rgb<u8>) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
        return;
    }
    let (top, right, bottom, left) = bbox.to_pixels();
    let (x0, x1) = (left.clamp(0, w - 1), right.clamp(0, w - 1));
    let (y0, y1) = (top.clamp(0, h - 1), bottom.clamp(0, h - 1));
    if x0 > x1 || y0 > y1 {
        return;
    }

    for t in 0..OUTLINE_WIDTH {
        for x in x0..=x1 {
            for y in [y0 + t, y1 - t] {
                if (y0..=y1).contains(&y) {
                    image.put_pixel(x as u32, y as u32, colour);
                }
            }
        }
        for y in y0..=y1 {
            for x in [x0 + t, x1 - t] {
                if (x0..=x1).contains(&x) {
                    image.put_pixel(x as u32, y as u32, colour);
                }
            }
        }
    }
}

/// Solid strip across the bottom `BAND_HEIGHT` rows of the box, clipped to
/// the box and the image.
fn draw_band(image: &mut RgbImage, bbox: &FaceBox, colour: Rgb<u8>) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let (top, right, bottom, left) = bbox.to_pixels();
    let (x0, x1) = (left.max(0), right.min(w - 1));
    let (y0, y1) = ((bottom - BAND_HEIGHT + 1).max(top).max(0), bottom.min(h - 1));
    for y in y0..=y1 {
        for x in x0..=x1 {
            image.put_pixel(x as u32, y as u32, colour);
        }
    }
}

type Job = (Frame, Vec<Annotation>);

/// Handle to the render thread.
pub struct RenderHandle {
    tx: Option<mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl RenderHandle {
    pub fn spawn(mut renderer: Box<dyn Renderer>) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Job>(1);
        let thread = std::thread::Builder::new()
            .name("rollcall-render".into())
            .spawn(move || {
                tracing::debug!("render thread started");
                while let Some((frame, annotations)) = rx.blocking_recv() {
                    renderer.annotate(&frame, &annotations);
                }
                tracing::debug!("render thread exiting");
            })?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    /// Hand a frame to the renderer. Returns false if it was skipped because
    /// the renderer is busy or gone.
    pub fn submit(&self, frame: Frame, annotations: Vec<Annotation>) -> bool {
        match &self.tx {
            Some(tx) => tx.try_send((frame, annotations)).is_ok(),
            None => false,
        }
    }

    /// Let the renderer finish its current frame, then stop it.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("render thread panicked");
            }
        }
    }
}

impl Drop for RenderHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recording(Arc<Mutex<Vec<(u64, usize)>>>);

    impl Renderer for Recording {
        fn annotate(&mut self, frame: &Frame, annotations: &[Annotation]) {
            self.0.lock().unwrap().push((frame.sequence, annotations.len()));
        }
    }

    fn annotation(label: Option<&str>) -> Annotation {
        Annotation {
            bbox: FaceBox::new(2.0, 8.0, 8.0, 2.0),
            label: label.map(String::from),
            distance: 0.3,
        }
    }

    #[test]
    fn test_draw_outline_leaves_interior() {
        let mut image = RgbImage::new(12, 12);
        draw_outline(&mut image, &FaceBox::new(2.0, 9.0, 9.0, 2.0), ACCEPTED_COLOUR);
        assert_eq!(image.get_pixel(2, 2), &ACCEPTED_COLOUR);
        assert_eq!(image.get_pixel(9, 5), &ACCEPTED_COLOUR);
        assert_eq!(image.get_pixel(5, 5), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_outline_clips_to_image() {
        let mut image = RgbImage::new(4, 4);
        draw_outline(&mut image, &FaceBox::new(-10.0, 50.0, 50.0, -10.0), REJECTED_COLOUR);
        assert_eq!(image.get_pixel(0, 0), &REJECTED_COLOUR);
        assert_eq!(image.get_pixel(3, 3), &REJECTED_COLOUR);
    }

    #[test]
    fn test_band_fills_bottom_of_box() {
        let mut image = RgbImage::new(60, 60);
        draw_band(&mut image, &FaceBox::new(0.0, 50.0, 50.0, 10.0), ACCEPTED_COLOUR);
        assert_eq!(image.get_pixel(30, 50), &ACCEPTED_COLOUR);
        assert_eq!(image.get_pixel(30, 16), &ACCEPTED_COLOUR);
        assert_eq!(image.get_pixel(30, 15), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(5, 40), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(55, 55), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_band_clipped_to_small_box_and_image() {
        let mut image = RgbImage::new(8, 8);
        draw_band(&mut image, &FaceBox::new(-4.0, 20.0, 6.0, -4.0), REJECTED_COLOUR);
        assert_eq!(image.get_pixel(0, 0), &REJECTED_COLOUR);
        assert_eq!(image.get_pixel(7, 6), &REJECTED_COLOUR);
        assert_eq!(image.get_pixel(7, 7), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_snapshot_only_for_accepted() {
        let dir = std::env::temp_dir().join(format!("rollcall-snap-{}", uuid::Uuid::new_v4()));
        let mut renderer = SnapshotRenderer::new(&dir).unwrap();

        let frame = Frame::new(RgbImage::new(16, 16), 3);
        renderer.annotate(&frame, &[annotation(None)]);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);

        renderer.annotate(&frame, &[annotation(None), annotation(Some("alice"))]);
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
        let written = image::open(dir.join("frame-00000003.png")).unwrap().to_rgb8();
        assert_eq!(written.get_pixel(2, 2), &ACCEPTED_COLOUR);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_handle_delivers_and_shuts_down() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handle = RenderHandle::spawn(Box::new(Recording(Arc::clone(&seen)))).unwrap();

        // A one-slot channel may refuse a frame while the renderer is busy;
        // retry until it is accepted.
        while !handle.submit(Frame::new(RgbImage::new(2, 2), 9), vec![annotation(Some("bob"))]) {
            std::thread::yield_now();
        }
        handle.shutdown();

        assert_eq!(seen.lock().unwrap().as_slice(), &[(9, 1)]);
        assert!(!handle.submit(Frame::new(RgbImage::new(2, 2), 10), Vec::new()));
    }
}
