//! Frame pipeline driver.
//!
//! `Starting` builds the gallery once. `Running` pulls frames from a
//! [`FrameSource`] on a dedicated capture thread, hands them through a
//! bounded queue, matches each one and records accepted identities.
//! `Stopping` releases the source and closes the ledger; `Stopped` is final.
//!
//! Per-frame failures (acquisition glitches, embedder errors, persistence
//! errors) are logged and counted; they never end the run.

use crate::cancel::CancelToken;
use crate::queue::{self, Pop, Producer};
use crate::render::{Annotation, RenderHandle};
use chrono::Local;
use rollcall_core::{Embedder, FrameMatcher, Gallery, GalleryBuilder, GalleryError};
use rollcall_hw::{Frame, FrameSource, FrameSourceError};
use rollcall_ledger::Ledger;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("gallery construction failed: {0}")]
    Gallery(#[from] GalleryError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
    #[error("pipeline cannot run from state {0:?}")]
    NotRunnable(PipelineState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Frames buffered between capture and matching.
    pub queue_capacity: usize,
    /// Upper bound on the acquisition rate.
    pub max_fps: Option<f32>,
    /// Transient acquisition failures in a row before giving up on the
    /// source. Zero retries forever.
    pub max_consecutive_failures: u32,
    /// Record and display labels in upper case.
    pub uppercase_labels: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 2,
            max_fps: None,
            max_consecutive_failures: 30,
            uppercase_labels: false,
        }
    }
}

/// Why [`Pipeline::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    /// The source ran out of frames.
    EndOfStream,
    /// The source failed permanently.
    SourceFailed(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::EndOfStream => write!(f, "end of stream"),
            StopReason::SourceFailed(e) => write!(f, "source failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub frames_captured: u64,
    /// Stale frames evicted from the queue before they were matched.
    pub frames_dropped: u64,
    pub frames_processed: u64,
    /// Frames skipped because the embedder failed.
    pub frames_failed: u64,
    pub acquisition_failures: u64,
    pub faces_detected: u64,
    pub matches_accepted: u64,
    pub records_written: u64,
    pub persistence_failures: u64,
    pub renders_skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    #[serde(flatten)]
    pub stats: RunStats,
}

/// What the capture thread reports when it exits.
struct Acquisition {
    reason: StopReason,
    captured: u64,
    failures: u64,
    released: bool,
}

pub struct Pipeline<E> {
    embedder: E,
    gallery: Arc<Gallery>,
    matcher: FrameMatcher,
    ledger: Arc<Ledger>,
    renderer: Option<RenderHandle>,
    options: PipelineOptions,
    state: PipelineState,
}

impl<E: Embedder> Pipeline<E> {
    /// Build the gallery from `gallery_dir`. A gallery failure aborts
    /// startup; the pipeline never reaches `Running`.
    pub fn start(
        mut embedder: E,
        gallery_dir: &Path,
        builder: &GalleryBuilder,
        matcher: FrameMatcher,
        ledger: Arc<Ledger>,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        tracing::info!(state = ?PipelineState::Starting, gallery = %gallery_dir.display(), "pipeline starting");
        let gallery = builder.build_from_dir(&mut embedder, gallery_dir)?;
        Ok(Self::with_gallery(embedder, gallery, matcher, ledger, options))
    }

    /// Use an already-built gallery.
    pub fn with_gallery(
        embedder: E,
        gallery: Gallery,
        matcher: FrameMatcher,
        ledger: Arc<Ledger>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            embedder,
            gallery: Arc::new(gallery),
            matcher,
            ledger,
            renderer: None,
            options,
            state: PipelineState::Starting,
        }
    }

    pub fn with_renderer(mut self, renderer: RenderHandle) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    /// Run until the source ends or fails permanently, or `cancel` fires.
    /// The source is released and the ledger closed before returning.
    pub fn run<S: FrameSource + Send>(
        &mut self,
        mut source: S,
        cancel: &CancelToken,
    ) -> Result<RunSummary, PipelineError> {
        if self.state != PipelineState::Starting {
            return Err(PipelineError::NotRunnable(self.state));
        }

        let (producer, consumer) = queue::channel(self.options.queue_capacity);
        let options = self.options.clone();
        let mut stats = RunStats::default();
        tracing::info!(source = %source.describe(), live = source.is_live(), entries = self.gallery.len(), "frame source attached");
        self.transition(PipelineState::Running);

        let acquisition = std::thread::scope(|s| -> Result<Acquisition, PipelineError> {
            let source = &mut source;
            let options = &options;
            // The queue closes when the capture thread drops `producer`, even on panic.
            let capture = std::thread::Builder::new()
                .name("rollcall-capture".into())
                .spawn_scoped(s, move || acquire(source, producer, cancel, options))
                .map_err(|source| PipelineError::Spawn { name: "capture", source })?;

            while let Pop::Item(frame) = consumer.pop(cancel) {
                self.process(frame, &mut stats);
            }
            self.transition(PipelineState::Stopping);

            Ok(capture.join().unwrap_or_else(|_| Acquisition {
                reason: StopReason::SourceFailed("capture thread panicked".into()),
                captured: 0,
                failures: 0,
                released: false,
            }))
        });

        let acquisition = match acquisition {
            Ok(a) => a,
            Err(e) => {
                source.release();
                self.shutdown();
                return Err(e);
            }
        };

        if !acquisition.released {
            source.release();
        }
        stats.frames_captured = acquisition.captured;
        stats.acquisition_failures = acquisition.failures;
        stats.frames_dropped = consumer.dropped();
        let stop_reason = if cancel.is_cancelled() {
            StopReason::Cancelled
        } else {
            acquisition.reason
        };

        self.shutdown();
        tracing::info!(
            reason = %stop_reason,
            processed = stats.frames_processed,
            dropped = stats.frames_dropped,
            failed = stats.frames_failed,
            recorded = stats.records_written,
            "pipeline stopped"
        );
        Ok(RunSummary { stop_reason, stats })
    }

    /// Match one frame and record every accepted identity in it.
    fn process(&mut self, frame: Frame, stats: &mut RunStats) {
        let results = match self.matcher.match_frame(&mut self.embedder, &frame.image, &self.gallery) {
            Ok(results) => results,
            Err(e) => {
                stats.frames_failed += 1;
                tracing::warn!(sequence = frame.sequence, error = %e, "frame skipped: embedder failed");
                return;
            }
        };
        stats.frames_processed += 1;
        stats.faces_detected += results.len() as u64;

        let now = Local::now();
        let mut annotations = Vec::with_capacity(results.len());
        for result in &results {
            let label = result.accepted_label().map(|l| self.display_label(l));
            if let Some(label) = &label {
                stats.matches_accepted += 1;
                match self.ledger.record(label, now) {
                    Ok(outcome) if outcome.written => stats.records_written += 1,
                    Ok(_) => {}
                    Err(e) => {
                        stats.persistence_failures += 1;
                        tracing::warn!(label = %label, error = %e, "attendance event dropped");
                    }
                }
            }
            annotations.push(Annotation::from_match(result, label));
        }

        if let Some(renderer) = &self.renderer {
            if !renderer.submit(frame, annotations) {
                stats.renders_skipped += 1;
            }
        }
    }

    fn display_label(&self, label: &str) -> String {
        if self.options.uppercase_labels {
            label.to_uppercase()
        } else {
            label.to_string()
        }
    }

    fn shutdown(&mut self) {
        if self.state != PipelineState::Stopping {
            self.transition(PipelineState::Stopping);
        }
        if let Err(e) = self.ledger.close() {
            tracing::warn!(error = %e, "failed to close attendance log");
        }
        if let Some(mut renderer) = self.renderer.take() {
            renderer.shutdown();
        }
        self.transition(PipelineState::Stopped);
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::info!(from = ?self.state, to = ?next, "pipeline state");
        self.state = next;
    }
}

/// Minimum spacing between pulls for a rate cap. `None` when there is no
/// cap or it is too small to express as a `Duration`.
fn frame_interval(max_fps: Option<f32>) -> Option<Duration> {
    let fps = max_fps?;
    match Duration::try_from_secs_f32(1.0 / fps) {
        Ok(interval) => Some(interval),
        Err(e) => {
            tracing::warn!(max_fps = fps, error = %e, "ignoring unusable frame rate cap");
            None
        }
    }
}

/// Capture loop, run on its own thread. Releases the source on exit;
/// dropping `frames` closes the queue.
fn acquire<S: FrameSource>(
    source: &mut S,
    frames: Producer<Frame>,
    cancel: &CancelToken,
    options: &PipelineOptions,
) -> Acquisition {
    let live = source.is_live();
    let interval = frame_interval(options.max_fps);
    let mut last_pull: Option<Instant> = None;
    let mut consecutive = 0u32;
    let mut captured = 0u64;
    let mut failures = 0u64;

    let reason = loop {
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }
        if let (Some(interval), Some(last)) = (interval, last_pull) {
            let elapsed = last.elapsed();
            if elapsed < interval && cancel.sleep(interval - elapsed) {
                break StopReason::Cancelled;
            }
        }
        last_pull = Some(Instant::now());

        match source.next_frame() {
            Ok(frame) => {
                consecutive = 0;
                captured += 1;
                if live {
                    if frames.push_latest(frame) {
                        tracing::debug!(queued = frames.len(), "matcher behind; dropped oldest queued frame");
                    }
                } else if !frames.push_wait(frame, cancel) {
                    break StopReason::Cancelled;
                }
            }
            Err(FrameSourceError::Exhausted) => break StopReason::EndOfStream,
            Err(e) if e.is_terminal() => {
                tracing::warn!(error = %e, "frame source failed");
                break StopReason::SourceFailed(e.to_string());
            }
            Err(e) => {
                consecutive += 1;
                failures += 1;
                tracing::warn!(error = %e, consecutive, "frame acquisition failed");
                if options.max_consecutive_failures > 0 && consecutive >= options.max_consecutive_failures {
                    break StopReason::SourceFailed(format!(
                        "{consecutive} consecutive acquisition failures, last: {e}"
                    ));
                }
            }
        }
    };

    source.release();
    Acquisition {
        reason,
        captured,
        failures,
        released: true,
    }
}
