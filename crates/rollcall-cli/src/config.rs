use rollcall_core::{Downscale, FailurePolicy, Threshold};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_DOWNSCALE: f32 = 0.25;
const DEFAULT_SOURCE: &str = "/dev/video0";
const DEFAULT_LOG_PATH: &str = "attendance.csv";
const DEFAULT_GALLERY_DIR: &str = "gallery";
const DEFAULT_QUEUE_CAPACITY: usize = 2;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("a match threshold is required (--threshold, ROLLCALL_THRESHOLD or `threshold` in the config file)")]
    MissingThreshold,
    #[error("match threshold must be finite and positive, got {0}")]
    InvalidThreshold(f32),
    #[error("downscale factor must be in (0, 1], got {0}")]
    InvalidDownscale(f32),
    #[error("queue capacity must be at least 1")]
    InvalidQueueCapacity,
    #[error("max fps must be positive with a representable frame interval, got {0}")]
    InvalidMaxFps(f32),
}

/// One configuration layer. Every field is optional; [`Settings::merge`]
/// lets a later layer override an earlier one.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub gallery_dir: Option<PathBuf>,
    pub threshold: Option<f32>,
    pub downscale: Option<f32>,
    pub source: Option<String>,
    pub log_path: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub gallery_policy: Option<FailurePolicy>,
    pub allow_empty_gallery: Option<bool>,
    pub queue_capacity: Option<usize>,
    pub max_fps: Option<f32>,
    pub max_consecutive_failures: Option<u32>,
    pub uppercase_labels: Option<bool>,
    pub snapshot_dir: Option<PathBuf>,
}

impl Settings {
    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the `ROLLCALL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            gallery_dir: lookup("ROLLCALL_GALLERY_DIR").map(PathBuf::from),
            threshold: env_parse(&lookup, "ROLLCALL_THRESHOLD")?,
            downscale: env_parse(&lookup, "ROLLCALL_DOWNSCALE")?,
            source: lookup("ROLLCALL_SOURCE"),
            log_path: lookup("ROLLCALL_LOG_PATH").map(PathBuf::from),
            model_dir: lookup("ROLLCALL_MODEL_DIR").map(PathBuf::from),
            queue_capacity: env_parse(&lookup, "ROLLCALL_QUEUE_CAPACITY")?,
            max_fps: env_parse(&lookup, "ROLLCALL_MAX_FPS")?,
            ..Self::default()
        })
    }

    /// Overlay `other` on top of `self`.
    pub fn merge(self, other: Settings) -> Settings {
        Settings {
            gallery_dir: other.gallery_dir.or(self.gallery_dir),
            threshold: other.threshold.or(self.threshold),
            downscale: other.downscale.or(self.downscale),
            source: other.source.or(self.source),
            log_path: other.log_path.or(self.log_path),
            model_dir: other.model_dir.or(self.model_dir),
            gallery_policy: other.gallery_policy.or(self.gallery_policy),
            allow_empty_gallery: other.allow_empty_gallery.or(self.allow_empty_gallery),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            max_fps: other.max_fps.or(self.max_fps),
            max_consecutive_failures: other
                .max_consecutive_failures
                .or(self.max_consecutive_failures),
            uppercase_labels: other.uppercase_labels.or(self.uppercase_labels),
            snapshot_dir: other.snapshot_dir.or(self.snapshot_dir),
        }
    }

    pub fn gallery_dir(&self) -> PathBuf {
        self.gallery_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_GALLERY_DIR))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH))
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir.clone().unwrap_or_else(default_model_dir)
    }

    pub fn gallery_policy(&self) -> FailurePolicy {
        self.gallery_policy.unwrap_or_default()
    }

    /// Validate and fill defaults for a matching run.
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let threshold = self.threshold.ok_or(ConfigError::MissingThreshold)?;
        let threshold = Threshold::new(threshold).map_err(|e| ConfigError::InvalidThreshold(e.0))?;

        let downscale = Downscale::new(self.downscale.unwrap_or(DEFAULT_DOWNSCALE))
            .map_err(|e| ConfigError::InvalidDownscale(e.0))?;

        let queue_capacity = self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
        if queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }

        if let Some(fps) = self.max_fps {
            if !fps.is_finite() || fps <= 0.0 || Duration::try_from_secs_f32(1.0 / fps).is_err() {
                return Err(ConfigError::InvalidMaxFps(fps));
            }
        }

        Ok(Config {
            gallery_dir: self.gallery_dir(),
            threshold,
            downscale,
            source: SourceSpec::parse(self.source.as_deref().unwrap_or(DEFAULT_SOURCE)),
            log_path: self.log_path(),
            model_dir: self.model_dir(),
            gallery_policy: self.gallery_policy(),
            allow_empty_gallery: self.allow_empty_gallery.unwrap_or(false),
            queue_capacity,
            max_fps: self.max_fps,
            max_consecutive_failures: self
                .max_consecutive_failures
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
            uppercase_labels: self.uppercase_labels.unwrap_or(false),
            snapshot_dir: self.snapshot_dir.clone(),
        })
    }
}

/// Validated configuration for `rollcall run`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of reference images, one identity per file.
    pub gallery_dir: PathBuf,
    pub threshold: Threshold,
    pub downscale: Downscale,
    pub source: SourceSpec,
    /// Attendance log; `.db`/`.sqlite` selects the SQLite store.
    pub log_path: PathBuf,
    /// Directory holding the ONNX detector and recognizer models.
    pub model_dir: PathBuf,
    pub gallery_policy: FailurePolicy,
    pub allow_empty_gallery: bool,
    pub queue_capacity: usize,
    pub max_fps: Option<f32>,
    /// Transient acquisition failures in a row before the source is given up.
    pub max_consecutive_failures: u32,
    pub uppercase_labels: bool,
    /// Where to write annotated PNGs of frames with accepted identities.
    pub snapshot_dir: Option<PathBuf>,
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// V4L2 device path.
    Camera(String),
    /// Directory of image files replayed in name order.
    Directory(PathBuf),
}

impl SourceSpec {
    /// A bare index `N` or a `/dev/...` path selects a camera; anything else
    /// is a directory to replay.
    pub fn parse(value: &str) -> Self {
        if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
            SourceSpec::Camera(format!("/dev/video{value}"))
        } else if value.starts_with("/dev/") {
            SourceSpec::Camera(value.to_string())
        } else {
            SourceSpec::Directory(PathBuf::from(value))
        }
    }
}

impl std::fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceSpec::Camera(path) => write!(f, "camera {path}"),
            SourceSpec::Directory(dir) => write!(f, "directory {}", dir.display()),
        }
    }
}

fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
    }
}
