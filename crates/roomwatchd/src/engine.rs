use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use image::{ImageFormat, RgbImage};
use roomwatch_core::annotate::annotate;
use roomwatch_core::recognizer::ARCFACE_ENCODING_DIM;
use roomwatch_core::{
    AlertSink, Config, FaceDetect, FaceDetector, FaceEncode, FaceRecognizer, FrameOutcome,
    FrameProcessor, KnownStore, MatchResult, OccupancyEvent, StoreError,
};
use roomwatch_hw::{Camera, FrameSource};
use thiserror::Error;

/// Requested capture resolution; the driver may negotiate another.
const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("encoding store: {0}")]
    Store(#[from] StoreError),
    #[error("camera error: {0}")]
    Camera(#[from] roomwatch_hw::CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] roomwatch_core::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] roomwatch_core::recognizer::RecognizerError),
    #[error("failed to spawn watch thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Quit requested by the user or a signal.
    Shutdown,
    /// The camera stopped producing frames.
    CaptureFailed,
}

/// Counters reported when the watch loop exits.
#[derive(Debug, Clone, Copy)]
pub struct WatchSummary {
    pub frames: u64,
    pub processed: u64,
    /// Buffers that could not be converted and were skipped.
    pub dropped: u64,
    pub alerts: u64,
    pub entries: u64,
    pub reason: StopReason,
}

impl WatchSummary {
    fn new() -> Self {
        Self {
            frames: 0,
            processed: 0,
            dropped: 0,
            alerts: 0,
            entries: 0,
            reason: StopReason::CaptureFailed,
        }
    }
}

/// Spawn the watch loop on a dedicated OS thread.
///
/// Checks the store against the recognizer's encoding width, then opens the
/// camera and loads both ONNX models, so a bad store, missing device or
/// model fails here rather than inside the thread. The loop runs until
/// `shutdown` is set or a frame cannot be captured; the camera is released
/// when the thread returns.
pub fn spawn_watch<S>(
    config: &Config,
    store: KnownStore,
    sink: S,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<WatchSummary>, EngineError>
where
    S: AlertSink + Send + 'static,
{
    store.check_dimensions(ARCFACE_ENCODING_DIM)?;

    let camera = Camera::open(&config.camera_device, CAPTURE_WIDTH, CAPTURE_HEIGHT)?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let detector_path = config.detector_model_path();
    let detector = FaceDetector::load(&detector_path)?;
    tracing::info!(path = %detector_path, "SCRFD detector loaded");

    let recognizer_path = config.recognizer_model_path();
    let recognizer = FaceRecognizer::load(&recognizer_path)?;
    tracing::info!(path = %recognizer_path, "ArcFace recognizer loaded");

    let settings = config.processor_settings();
    let processor = FrameProcessor::new(detector, recognizer, sink, store, settings);
    let warmup_frames = config.warmup_frames;
    let preview_path = config.preview_path.clone();

    let handle = std::thread::Builder::new()
        .name("roomwatch-watch".into())
        .spawn(move || run_camera(camera, processor, warmup_frames, preview_path, &shutdown))?;
    Ok(handle)
}

/// Stream from `camera` until the loop stops. The stream and then the camera
/// are dropped on return.
fn run_camera<S: AlertSink>(
    camera: Camera,
    processor: FrameProcessor<FaceDetector, FaceRecognizer, S>,
    warmup_frames: usize,
    preview_path: Option<PathBuf>,
    shutdown: &AtomicBool,
) -> WatchSummary {
    let summary = match camera.stream() {
        Ok(stream) => watch_loop(
            stream,
            processor,
            warmup_frames,
            preview_path.as_deref(),
            shutdown,
        ),
        Err(e) => {
            tracing::error!(error = %e, "failed to start capture");
            WatchSummary::new()
        }
    };
    summary
}

/// Feed frames from `source` to `processor` until `shutdown` is set or the
/// source fails to read. A frame that fails to convert is skipped.
fn watch_loop<F, D, E, S>(
    mut source: F,
    mut processor: FrameProcessor<D, E, S>,
    warmup_frames: usize,
    preview_path: Option<&Path>,
    shutdown: &AtomicBool,
) -> WatchSummary
where
    F: FrameSource,
    D: FaceDetect,
    E: FaceEncode,
    S: AlertSink,
{
    let mut summary = WatchSummary::new();

    // Discard warmup frames for camera AGC/AE stabilization
    if warmup_frames > 0 {
        tracing::info!(count = warmup_frames, "discarding warmup frames");
        source.discard(warmup_frames);
    }

    tracing::info!("watch loop started");
    loop {
        if shutdown.load(Ordering::Relaxed) {
            summary.reason = StopReason::Shutdown;
            break;
        }

        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) if e.is_frame_local() => {
                summary.dropped += 1;
                tracing::warn!(error = %e, "skipping unreadable frame");
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to capture frame, stopping");
                break;
            }
        };
        summary.frames += 1;

        let report = match processor.ingest(&frame.image, frame.timestamp) {
            Ok(FrameOutcome::Processed(report)) => report,
            Ok(FrameOutcome::Skipped) => continue,
            Err(e) => {
                tracing::warn!(seq = frame.sequence, error = %e, "frame processing failed");
                continue;
            }
        };

        summary.processed += 1;
        if report.alert.is_some() {
            summary.alerts += 1;
        }
        if report.event == Some(OccupancyEvent::Entered) {
            summary.entries += 1;
        }

        if let Some(path) = preview_path {
            write_preview(path, &frame.image, &report.results);
        }
    }

    tracing::info!(
        frames = summary.frames,
        processed = summary.processed,
        dropped = summary.dropped,
        alerts = summary.alerts,
        entries = summary.entries,
        reason = ?summary.reason,
        "watch loop exiting"
    );
    summary
}

/// Overwrite the preview file with the annotated frame. Failures are logged only.
fn write_preview(path: &Path, frame: &RgbImage, results: &[MatchResult]) {
    let annotated = annotate(frame, results);
    if let Err(e) = annotated.save_with_format(path, ImageFormat::Jpeg) {
        tracing::warn!(path = %path.display(), error = %e, "failed to write preview");
    }
}
