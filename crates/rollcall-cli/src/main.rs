use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rollcall_core::{Embedder, FailurePolicy, FrameMatcher, GalleryBuilder};
use rollcall_hw::{DirectorySource, FrameSource};
use rollcall_ledger::{open_store, Ledger};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod cancel;
mod config;
mod pipeline;
mod queue;
mod render;

use cancel::cancel_pair;
use config::{Settings, SourceSpec};
use pipeline::{Pipeline, PipelineOptions, StopReason};
use render::{RenderHandle, Renderer, SnapshotRenderer, TracingRenderer};

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Live face-matching attendance")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match faces from a camera or frame directory and record attendance
    Run {
        #[command(flatten)]
        overrides: Overrides,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Build the gallery and list its identities
    Gallery {
        #[command(flatten)]
        overrides: Overrides,
        #[arg(long)]
        json: bool,
    },
    /// Print the attendance log
    Log {
        /// Attendance log path
        #[arg(long)]
        log: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Start a new session by emptying the attendance log
    Clear {
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
}

/// Command-line layer of the configuration.
#[derive(Args)]
struct Overrides {
    /// Directory of reference images, one identity per file
    #[arg(long)]
    gallery: Option<PathBuf>,
    /// Maximum descriptor distance for a match
    #[arg(long)]
    threshold: Option<f32>,
    /// Per-axis downscale factor before detection
    #[arg(long)]
    downscale: Option<f32>,
    /// Camera index, /dev/videoN path, or directory of frames
    #[arg(long)]
    source: Option<String>,
    /// Attendance log (.db/.sqlite for SQLite)
    #[arg(long)]
    log: Option<PathBuf>,
    /// Directory holding the ONNX models
    #[arg(long)]
    model_dir: Option<PathBuf>,
    #[arg(long)]
    max_fps: Option<f32>,
    #[arg(long)]
    queue_capacity: Option<usize>,
    /// Write annotated PNGs of frames with recognised faces here
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
    /// Abort if any reference image is unusable
    #[arg(long)]
    strict_gallery: bool,
    /// Run even if no reference image yields a face
    #[arg(long)]
    allow_empty_gallery: bool,
    /// Record labels in upper case
    #[arg(long)]
    uppercase: bool,
}

impl Overrides {
    fn into_settings(self) -> Settings {
        Settings {
            gallery_dir: self.gallery,
            threshold: self.threshold,
            downscale: self.downscale,
            source: self.source,
            log_path: self.log,
            model_dir: self.model_dir,
            gallery_policy: self.strict_gallery.then_some(FailurePolicy::Fail),
            allow_empty_gallery: self.allow_empty_gallery.then_some(true),
            queue_capacity: self.queue_capacity,
            max_fps: self.max_fps,
            max_consecutive_failures: None,
            uppercase_labels: self.uppercase.then_some(true),
            snapshot_dir: self.snapshot_dir,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_file = cli.config.as_deref();

    match cli.command {
        Commands::Run { overrides, json } => {
            run(load_settings(config_file, overrides.into_settings())?, json).await
        }
        Commands::Gallery { overrides, json } => {
            gallery(&load_settings(config_file, overrides.into_settings())?, json)
        }
        Commands::Log { log, json } => {
            let settings = load_settings(config_file, Settings { log_path: log, ..Settings::default() })?;
            print_log(&settings.log_path(), json)
        }
        Commands::Clear { log } => {
            let settings = load_settings(config_file, Settings { log_path: log, ..Settings::default() })?;
            let path = settings.log_path();
            let ledger = Ledger::open(open_store(&path)?)?;
            ledger.clear()?;
            ledger.close()?;
            println!("cleared {}", path.display());
            Ok(())
        }
        Commands::Devices => list_devices(),
    }
}

/// Config file, then environment, then flags.
fn load_settings(file: Option<&Path>, flags: Settings) -> Result<Settings> {
    let base = match file {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    Ok(base.merge(Settings::from_env()?).merge(flags))
}

async fn run(settings: Settings, json: bool) -> Result<()> {
    let config = settings.resolve()?;
    tracing::info!(
        gallery = %config.gallery_dir.display(),
        source = %config.source,
        log = %config.log_path.display(),
        threshold = config.threshold.get(),
        downscale = config.downscale.factor(),
        "rollcall starting"
    );

    let embedder = load_embedder(&config.model_dir)?;
    let ledger = Arc::new(Ledger::open(open_store(&config.log_path)?)?);
    let builder = GalleryBuilder::new()
        .policy(config.gallery_policy)
        .allow_empty(config.allow_empty_gallery);
    let matcher = FrameMatcher::new(config.threshold, config.downscale);
    let options = PipelineOptions {
        queue_capacity: config.queue_capacity,
        max_fps: config.max_fps,
        max_consecutive_failures: config.max_consecutive_failures,
        uppercase_labels: config.uppercase_labels,
    };

    let renderer: Box<dyn Renderer> = match &config.snapshot_dir {
        Some(dir) => Box::new(SnapshotRenderer::new(dir)?),
        None => Box::new(TracingRenderer),
    };
    let mut pipeline = Pipeline::start(embedder, &config.gallery_dir, &builder, matcher, ledger, options)?
        .with_renderer(RenderHandle::spawn(renderer)?);
    tracing::info!(
        identities = pipeline.gallery().len(),
        state = ?pipeline.state(),
        "gallery ready"
    );
    let source = open_source(&config.source)?;

    let (canceller, token) = cancel_pair();
    let mut worker = tokio::task::spawn_blocking(move || pipeline.run(source, &token));

    let summary = tokio::select! {
        joined = &mut worker => joined??,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupt received, stopping");
            canceller.cancel();
            worker.await??
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        let s = &summary.stats;
        println!("stopped: {}", summary.stop_reason);
        println!(
            "frames: {} captured, {} processed, {} dropped, {} failed",
            s.frames_captured, s.frames_processed, s.frames_dropped, s.frames_failed
        );
        println!(
            "faces: {} detected, {} recognised, {} new attendance records",
            s.faces_detected, s.matches_accepted, s.records_written
        );
        if s.persistence_failures > 0 {
            println!("warning: {} attendance events could not be saved", s.persistence_failures);
        }
    }

    if let StopReason::SourceFailed(reason) = summary.stop_reason {
        anyhow::bail!("frame source failed: {reason}");
    }
    Ok(())
}

fn gallery(settings: &Settings, json: bool) -> Result<()> {
    let dir = settings.gallery_dir();
    let mut embedder = load_embedder(&settings.model_dir())?;
    let gallery = GalleryBuilder::new()
        .policy(settings.gallery_policy())
        .allow_empty(true)
        .build_from_dir(&mut embedder, &dir)?;

    if json {
        let entries: Vec<_> = gallery
            .entries()
            .iter()
            .map(|e| serde_json::json!({ "label": e.label, "dimensions": e.descriptor.len() }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        println!("{} identities in {}", gallery.len(), dir.display());
        for entry in gallery.entries() {
            println!("  {} ({}-d)", entry.label, entry.descriptor.len());
        }
    }
    Ok(())
}

fn print_log(path: &Path, json: bool) -> Result<()> {
    let mut store = open_store(path)?;
    let records = store.load()?;
    store.close()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        println!("{}", rollcall_ledger::text::HEADER);
        for record in &records {
            println!("{}", rollcall_ledger::text::format_line(record));
        }
    }
    Ok(())
}

fn open_source(spec: &SourceSpec) -> Result<Box<dyn FrameSource + Send>> {
    match spec {
        SourceSpec::Directory(dir) => Ok(Box::new(DirectorySource::open(dir)?)),
        SourceSpec::Camera(path) => open_camera(path),
    }
}

#[cfg(feature = "v4l")]
fn open_camera(path: &str) -> Result<Box<dyn FrameSource + Send>> {
    let camera = rollcall_hw::Camera::open(path)?;
    tracing::info!(
        device = path,
        width = camera.width,
        height = camera.height,
        format = ?camera.pixel_format,
        "camera ready"
    );
    Ok(Box::new(camera))
}

#[cfg(not(feature = "v4l"))]
fn open_camera(path: &str) -> Result<Box<dyn FrameSource + Send>> {
    anyhow::bail!("camera source {path} needs V4L2 support; rebuild with `--features v4l` or pass a frame directory")
}

#[cfg(feature = "onnx")]
fn load_embedder(model_dir: &Path) -> Result<Box<dyn Embedder + Send>> {
    let embedder = rollcall_core::onnx::OnnxEmbedder::load(model_dir)?;
    tracing::info!(dir = %model_dir.display(), "face models loaded");
    Ok(Box::new(embedder))
}

#[cfg(not(feature = "onnx"))]
fn load_embedder(model_dir: &Path) -> Result<Box<dyn Embedder + Send>> {
    anyhow::bail!(
        "no face embedder available (models in {}); rebuild with `--features onnx`",
        model_dir.display()
    )
}

#[cfg(feature = "v4l")]
fn list_devices() -> Result<()> {
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("no V4L2 capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

#[cfg(not(feature = "v4l"))]
fn list_devices() -> Result<()> {
    anyhow::bail!("device listing needs V4L2 support; rebuild with `--features v4l`")
}
