//! Gallery of known identities, built once from labeled reference images.

use crate::embedder::{EmbedError, Embedder};
use crate::types::{Descriptor, GalleryEntry};
use image::{ImageFormat, RgbImage};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot read gallery directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no reference images found in {0}")]
    NoReferenceImages(PathBuf),
    #[error("no reference image produced a descriptor")]
    Empty,
    #[error("duplicate gallery label {0:?}")]
    DuplicateLabel(String),
    #[error("invalid label {0:?}: labels must be non-empty and contain no line breaks")]
    InvalidLabel(String),
    #[error("failed to decode reference image {path}: {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error("no face found in reference image for {0:?}")]
    NoFace(String),
    #[error("embedder failed on reference image for {label:?}: {source}")]
    Embedding { label: String, source: EmbedError },
}

/// What to do with a reference image that cannot contribute an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log a warning and leave the image out.
    #[default]
    Skip,
    /// Abort gallery construction.
    Fail,
}

/// Immutable, ordered `(label, descriptor)` table. Labels are unique.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    /// Build a gallery from ready-made entries, rejecting duplicate labels.
    pub fn new(entries: Vec<GalleryEntry>) -> Result<Self, GalleryError> {
        let mut seen = HashSet::new();
        for e in &entries {
            if !seen.insert(e.label.as_str()) {
                return Err(GalleryError::DuplicateLabel(e.label.clone()));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }
}

/// Builds a [`Gallery`] by asking an embedder for one descriptor per image.
///
/// - An image with several faces contributes its first face.
/// - An image with no face, or that fails to decode or embed, is handled
///   according to the [`FailurePolicy`].
/// - A label seen again later is ignored with a warning (first one wins).
#[derive(Debug, Clone, Default)]
pub struct GalleryBuilder {
    policy: FailurePolicy,
    allow_empty: bool,
}

impl GalleryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Accept a gallery with zero entries instead of failing.
    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    /// Build from every decodable image file in `dir`.
    ///
    /// Files are visited in file-name order and labeled by their stem
    /// (`alice.jpg` → `alice`). Files without a recognised image extension
    /// are ignored.
    pub fn build_from_dir<E: Embedder + ?Sized>(
        &self,
        embedder: &mut E,
        dir: &Path,
    ) -> Result<Gallery, GalleryError> {
        let paths = reference_images(dir)?;
        if paths.is_empty() {
            return Err(GalleryError::NoReferenceImages(dir.to_path_buf()));
        }
        tracing::info!(dir = %dir.display(), images = paths.len(), "building gallery");

        let mut acc = Accumulator::new(self.policy);
        for path in paths {
            let label = label_for(&path);
            let image = match image::open(&path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    acc.reject(GalleryError::Decode {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                    continue;
                }
            };
            acc.add(embedder, label, &image)?;
        }
        self.finish(acc)
    }

    /// Build from in-memory `(label, image)` pairs, in iteration order.
    pub fn build<E, I>(&self, embedder: &mut E, images: I) -> Result<Gallery, GalleryError>
    where
        E: Embedder + ?Sized,
        I: IntoIterator<Item = (String, RgbImage)>,
    {
        let mut acc = Accumulator::new(self.policy);
        for (label, image) in images {
            acc.add(embedder, label, &image)?;
        }
        self.finish(acc)
    }

    fn finish(&self, acc: Accumulator) -> Result<Gallery, GalleryError> {
        if acc.entries.is_empty() {
            if !self.allow_empty {
                return Err(GalleryError::Empty);
            }
            tracing::warn!(skipped = acc.skipped, "gallery is empty; no face will ever be accepted");
        }
        tracing::info!(entries = acc.entries.len(), skipped = acc.skipped, "gallery ready");
        Ok(Gallery { entries: acc.entries })
    }
}

struct Accumulator {
    policy: FailurePolicy,
    entries: Vec<GalleryEntry>,
    seen: HashSet<String>,
    skipped: usize,
}

impl Accumulator {
    fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            entries: Vec::new(),
            seen: HashSet::new(),
            skipped: 0,
        }
    }

    fn add<E: Embedder + ?Sized>(
        &mut self,
        embedder: &mut E,
        label: String,
        image: &RgbImage,
    ) -> Result<(), GalleryError> {
        if label.is_empty() || label.contains(['\n', '\r']) {
            return self.reject(GalleryError::InvalidLabel(label));
        }
        if self.seen.contains(&label) {
            // Not subject to the failure policy: the first entry stays usable.
            tracing::warn!(label = %label, "duplicate gallery label; keeping the first entry");
            self.skipped += 1;
            return Ok(());
        }

        let descriptor = match embedder.encode_known(image) {
            Ok(descriptors) => first_descriptor(&label, descriptors),
            Err(source) => return self.reject(GalleryError::Embedding { label, source }),
        };
        let Some(descriptor) = descriptor else {
            return self.reject(GalleryError::NoFace(label));
        };

        tracing::debug!(label = %label, dim = descriptor.len(), "gallery entry added");
        self.seen.insert(label.clone());
        self.entries.push(GalleryEntry { label, descriptor });
        Ok(())
    }

    fn reject(&mut self, err: GalleryError) -> Result<(), GalleryError> {
        match self.policy {
            FailurePolicy::Fail => Err(err),
            FailurePolicy::Skip => {
                tracing::warn!(error = %err, "skipping reference image");
                self.skipped += 1;
                Ok(())
            }
        }
    }
}

fn first_descriptor(label: &str, descriptors: Vec<Descriptor>) -> Option<Descriptor> {
    if descriptors.len() > 1 {
        tracing::warn!(label, faces = descriptors.len(), "several faces in reference image; using the first");
    }
    descriptors.into_iter().next()
}

fn label_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Image files directly inside `dir`, sorted by file name.
fn reference_images(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let io_err = |source| GalleryError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && ImageFormat::from_path(&path).is_ok() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::testing::{face, ScriptedEmbedder};

    fn img() -> RgbImage {
        RgbImage::new(4, 4)
    }

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rollcall-gallery-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_one_entry_per_image_in_order() {
        let mut embedder = ScriptedEmbedder::default();
        embedder.push_faces(vec![face(&[1.0, 0.0])]);
        embedder.push_faces(vec![face(&[0.0, 1.0])]);

        let gallery = GalleryBuilder::new()
            .build(&mut embedder, vec![("alice".into(), img()), ("bob".into(), img())])
            .unwrap();
        assert_eq!(gallery.labels().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert_eq!(gallery.entries()[1].descriptor.values(), &[0.0, 1.0]);
    }

    #[test]
    fn test_first_face_wins() {
        let mut embedder = ScriptedEmbedder::default();
        embedder.push_faces(vec![face(&[1.0]), face(&[2.0]), face(&[3.0])]);
        let gallery = GalleryBuilder::new()
            .build(&mut embedder, vec![("group".into(), img())])
            .unwrap();
        assert_eq!(gallery.entries()[0].descriptor.values(), &[1.0]);
    }

    #[test]
    fn test_zero_faces_skipped_by_default() {
        let mut embedder = ScriptedEmbedder::default();
        embedder.push_faces(Vec::new());
        embedder.push_faces(vec![face(&[0.5])]);
        let gallery = GalleryBuilder::new()
            .build(&mut embedder, vec![("blank".into(), img()), ("carol".into(), img())])
            .unwrap();
        assert_eq!(gallery.labels().collect::<Vec<_>>(), vec!["carol"]);
    }

    #[test]
    fn test_zero_faces_fatal_with_fail_policy() {
        let mut embedder = ScriptedEmbedder::default();
        embedder.push_faces(Vec::new());
        let err = GalleryBuilder::new()
            .policy(FailurePolicy::Fail)
            .build(&mut embedder, vec![("blank".into(), img())])
            .unwrap_err();
        assert!(matches!(err, GalleryError::NoFace(label) if label == "blank"));
    }

    #[test]
    fn test_embedder_error_respects_policy() {
        let mut embedder = ScriptedEmbedder::default();
        embedder.push_error(EmbedError::Encoding("bad crop".into()));
        embedder.push_faces(vec![face(&[0.5])]);
        let gallery = GalleryBuilder::new()
            .build(&mut embedder, vec![("broken".into(), img()), ("dave".into(), img())])
            .unwrap();
        assert_eq!(gallery.len(), 1);

        let mut embedder = ScriptedEmbedder::default();
        embedder.push_error(EmbedError::Encoding("bad crop".into()));
        let err = GalleryBuilder::new()
            .policy(FailurePolicy::Fail)
            .build(&mut embedder, vec![("broken".into(), img())])
            .unwrap_err();
        assert!(matches!(err, GalleryError::Embedding { .. }));
    }

    #[test]
    fn test_duplicate_label_keeps_first() {
        let mut embedder = ScriptedEmbedder::default();
        embedder.push_faces(vec![face(&[1.0])]);
        embedder.push_faces(vec![face(&[9.0])]);
        let gallery = GalleryBuilder::new()
            .policy(FailurePolicy::Fail)
            .build(&mut embedder, vec![("alice".into(), img()), ("alice".into(), img())])
            .unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.entries()[0].descriptor.values(), &[1.0]);
        // The duplicate never reached the embedder.
        assert_eq!(embedder.seen_sizes.len(), 1);
    }

    #[test]
    fn test_label_with_line_break_rejected() {
        let mut embedder = ScriptedEmbedder::default();
        let err = GalleryBuilder::new()
            .policy(FailurePolicy::Fail)
            .build(&mut embedder, vec![("bad\nname".into(), img())])
            .unwrap_err();
        assert!(matches!(err, GalleryError::InvalidLabel(_)));
    }

    #[test]
    fn test_empty_result_is_error_unless_allowed() {
        let mut embedder = ScriptedEmbedder::default();
        embedder.push_faces(Vec::new());
        let err = GalleryBuilder::new()
            .build(&mut embedder, vec![("blank".into(), img())])
            .unwrap_err();
        assert!(matches!(err, GalleryError::Empty));

        let mut embedder = ScriptedEmbedder::default();
        let gallery = GalleryBuilder::new()
            .allow_empty(true)
            .build(&mut embedder, Vec::new())
            .unwrap();
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_gallery_new_rejects_duplicates() {
        let e = GalleryEntry { label: "x".into(), descriptor: Descriptor::new(vec![1.0]) };
        assert!(matches!(
            Gallery::new(vec![e.clone(), e]),
            Err(GalleryError::DuplicateLabel(_))
        ));
    }

    #[test]
    fn test_build_from_dir_sorted_by_name() {
        let dir = scratch_dir();
        RgbImage::new(8, 8).save(dir.join("carol.png")).unwrap();
        RgbImage::new(8, 8).save(dir.join("alice.png")).unwrap();
        std::fs::write(dir.join("notes.txt"), "not an image").unwrap();

        let mut embedder = ScriptedEmbedder::default();
        embedder.push_faces(vec![face(&[1.0])]);
        embedder.push_faces(vec![face(&[2.0])]);
        let gallery = GalleryBuilder::new().build_from_dir(&mut embedder, &dir).unwrap();

        assert_eq!(gallery.labels().collect::<Vec<_>>(), vec!["alice", "carol"]);
        assert_eq!(gallery.entries()[0].descriptor.values(), &[1.0]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_build_from_dir_skips_undecodable_file() {
        let dir = scratch_dir();
        std::fs::write(dir.join("corrupt.jpg"), b"definitely not a jpeg").unwrap();
        RgbImage::new(8, 8).save(dir.join("erin.png")).unwrap();

        let mut embedder = ScriptedEmbedder::default();
        embedder.push_faces(vec![face(&[1.0])]);
        let gallery = GalleryBuilder::new().build_from_dir(&mut embedder, &dir).unwrap();
        assert_eq!(gallery.labels().collect::<Vec<_>>(), vec!["erin"]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_build_from_dir_without_images() {
        let dir = scratch_dir();
        let mut embedder = ScriptedEmbedder::default();
        let err = GalleryBuilder::new().build_from_dir(&mut embedder, &dir).unwrap_err();
        assert!(matches!(err, GalleryError::NoReferenceImages(_)));
        std::fs::remove_dir_all(&dir).unwrap();

        let missing = dir.join("missing");
        assert!(matches!(
            GalleryBuilder::new().build_from_dir(&mut embedder, &missing),
            Err(GalleryError::Io { .. })
        ));
    }
}
