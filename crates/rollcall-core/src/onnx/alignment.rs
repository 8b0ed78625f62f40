//! Face alignment to the canonical ArcFace crop.
//!
//! A 4-DOF similarity (scale, rotation, translation) is fitted in closed form
//! from the five detected landmarks to the reference positions, then the crop
//! is sampled by inverse mapping with bilinear interpolation.

use super::detector::Landmarks;
use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

pub const ALIGNED_SIZE: u32 = 112;

/// Reference landmark positions in the 112×112 crop.
const REFERENCE: Landmarks = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// `dst = [a -b; b a] · src + (tx, ty)`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` onto `dst`. `None` if `src` is degenerate.
    fn fit(src: &Landmarks, dst: &Landmarks) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &Landmarks| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sx / n, sy / n)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let (mut dot, mut cross, mut var) = (0.0f32, 0.0f32, 0.0f32);
        for (s, d) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (s.0 - msx, s.1 - msy);
            let (dx, dy) = (d.0 - mdx, d.1 - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            var += sx * sx + sy * sy;
        }
        if var <= f32::EPSILON {
            return None;
        }

        let (a, b) = (dot / var, cross / var);
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    fn invert(&self, (x, y): (f32, f32)) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (x, y) = (x - self.tx, y - self.ty);
        ((self.a * x + self.b * y) / det, (-self.b * x + self.a * y) / det)
    }
}

/// Warp the face described by `landmarks` into a 112×112 crop.
pub fn align(frame: &RgbImage, landmarks: &Landmarks) -> Option<RgbImage> {
    let transform = Similarity::fit(landmarks, &REFERENCE)?;
    Some(RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |u, v| {
        let (x, y) = transform.invert((u as f32, v as f32));
        sample_bilinear(frame, x, y)
    }))
}

/// Crop the bounding box and resize it to 112×112, for detections without landmarks.
pub fn crop_resize(frame: &RgbImage, bbox: &FaceBox) -> Option<RgbImage> {
    let (width, height) = frame.dimensions();
    let left = bbox.left.max(0.0) as u32;
    let top = bbox.top.max(0.0) as u32;
    let right = (bbox.right.max(0.0) as u32).min(width);
    let bottom = (bbox.bottom.max(0.0) as u32).min(height);
    if right <= left || bottom <= top {
        return None;
    }
    let crop = imageops::crop_imm(frame, left, top, right - left, bottom - top).to_image();
    Some(imageops::resize(&crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle))
}

fn sample_bilinear(frame: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = frame.dimensions();
    if x < 0.0 || y < 0.0 || x > (width - 1) as f32 || y > (height - 1) as f32 {
        return Rgb([0, 0, 0]);
    }
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(width - 1), (y0 + 1).min(height - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let tl = frame.get_pixel(x0, y0);
    let tr = frame.get_pixel(x1, y0);
    let bl = frame.get_pixel(x0, y1);
    let br = frame.get_pixel(x1, y1);

    Rgb(std::array::from_fn(|c| {
        let top = tl[c] as f32 * (1.0 - fx) + tr[c] as f32 * fx;
        let bottom = bl[c] as f32 * (1.0 - fx) + br[c] as f32 * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_identity() {
        let t = Similarity::fit(&REFERENCE, &REFERENCE).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4 && t.b.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_fit_recovers_scale_and_shift() {
        let src: Landmarks = std::array::from_fn(|i| {
            let (x, y) = REFERENCE[i];
            (x / 2.0 + 100.0, y / 2.0 + 40.0)
        });
        let t = Similarity::fit(&src, &REFERENCE).unwrap();
        for (s, d) in src.iter().zip(REFERENCE.iter()) {
            let (x, y) = t.apply(*s);
            assert!((x - d.0).abs() < 1e-2 && (y - d.1).abs() < 1e-2);
            let back = t.invert(*d);
            assert!((back.0 - s.0).abs() < 1e-2 && (back.1 - s.1).abs() < 1e-2);
        }
    }

    #[test]
    fn test_fit_degenerate() {
        let same = [(5.0, 5.0); 5];
        assert!(Similarity::fit(&same, &REFERENCE).is_none());
    }

    #[test]
    fn test_align_output_size() {
        let frame = RgbImage::from_pixel(200, 200, Rgb([90, 90, 90]));
        let aligned = align(&frame, &REFERENCE).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(aligned.get_pixel(56, 56), &Rgb([90, 90, 90]));
    }

    #[test]
    fn test_crop_resize_bounds() {
        let frame = RgbImage::new(50, 50);
        assert!(crop_resize(&frame, &FaceBox::new(10.0, 40.0, 45.0, 5.0)).is_some());
        assert!(crop_resize(&frame, &FaceBox::new(10.0, 5.0, 45.0, 40.0)).is_none());
        let clipped = crop_resize(&frame, &FaceBox::new(-10.0, 80.0, 90.0, -3.0)).unwrap();
        assert_eq!(clipped.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }
}
