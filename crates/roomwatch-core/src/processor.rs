//! Per-frame decision loop.
//!
//! Every Nth frame is downscaled, searched for faces, matched against the
//! known store and fed to the occupancy tracker. Frames with at least one
//! intruder produce a single [`AlertBatch`] holding the full-resolution frame.

use std::borrow::Cow;
use std::time::{Duration, Instant};

use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;
use uuid::Uuid;

use crate::alert::{AlertBatch, AlertSink};
use crate::detector::{DetectorError, FaceDetect};
use crate::occupancy::{OccupancyEvent, OccupancyTracker, RoomState, DEFAULT_NO_FACE_TIMEOUT};
use crate::recognizer::{FaceEncode, RecognizerError};
use crate::store::KnownStore;
use crate::types::{Detection, Encoding, FirstMatch, MatchResult, Matcher, DEFAULT_MATCH_TOLERANCE};

pub const DEFAULT_RESIZE_FACTOR: f32 = 0.8;
pub const DEFAULT_FRAME_SKIP: u64 = 5;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessorSettings {
    /// Downscale factor in `(0, 1]` applied before detection.
    pub resize_factor: f32,
    /// Evaluate every Nth frame; 1 evaluates all of them.
    pub frame_skip: u64,
    pub no_face_timeout: Duration,
    pub match_tolerance: f32,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            resize_factor: DEFAULT_RESIZE_FACTOR,
            frame_skip: DEFAULT_FRAME_SKIP,
            no_face_timeout: DEFAULT_NO_FACE_TIMEOUT,
            match_tolerance: DEFAULT_MATCH_TOLERANCE,
        }
    }
}

/// What happened on one evaluated frame.
#[derive(Debug)]
pub struct FrameReport {
    /// One result per detected face, boxes in source-frame coordinates.
    pub results: Vec<MatchResult>,
    pub event: Option<OccupancyEvent>,
    pub state: RoomState,
    /// Id of the alert batch dispatched for this frame, if any.
    pub alert: Option<Uuid>,
}

impl FrameReport {
    pub fn intruders(&self) -> usize {
        self.results.iter().filter(|r| r.is_intruder()).count()
    }
}

#[derive(Debug)]
pub enum FrameOutcome {
    /// Not a sampled frame; no detection or occupancy update happened.
    Skipped,
    Processed(FrameReport),
}

pub struct FrameProcessor<D, E, S, M = FirstMatch> {
    detector: D,
    encoder: E,
    sink: S,
    matcher: M,
    store: KnownStore,
    tracker: OccupancyTracker,
    pending: Vec<RgbImage>,
    resize_factor: f32,
    frame_skip: u64,
    frames_seen: u64,
}

impl<D: FaceDetect, E: FaceEncode, S: AlertSink> FrameProcessor<D, E, S> {
    /// Processor using the positional [`FirstMatch`] rule at the configured tolerance.
    pub fn new(
        detector: D,
        encoder: E,
        sink: S,
        store: KnownStore,
        settings: ProcessorSettings,
    ) -> Self {
        let matcher = FirstMatch {
            tolerance: settings.match_tolerance,
        };
        Self::with_matcher(detector, encoder, sink, matcher, store, settings)
    }
}

impl<D, E, S, M> FrameProcessor<D, E, S, M>
where
    D: FaceDetect,
    E: FaceEncode,
    S: AlertSink,
    M: Matcher,
{
    pub fn with_matcher(
        detector: D,
        encoder: E,
        sink: S,
        matcher: M,
        store: KnownStore,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            detector,
            encoder,
            sink,
            matcher,
            store,
            tracker: OccupancyTracker::new(settings.no_face_timeout),
            pending: Vec::new(),
            resize_factor: settings.resize_factor,
            frame_skip: settings.frame_skip.max(1),
            frames_seen: 0,
        }
    }

    pub fn state(&self) -> RoomState {
        self.tracker.state()
    }

    pub fn store(&self) -> &KnownStore {
        &self.store
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Count one captured frame and evaluate it if it is a sampled one.
    ///
    /// `now` is the capture time used for the no-face debounce.
    pub fn ingest(&mut self, frame: &RgbImage, now: Instant) -> Result<FrameOutcome, ProcessError> {
        self.frames_seen += 1;
        if self.frames_seen % self.frame_skip != 0 {
            return Ok(FrameOutcome::Skipped);
        }
        self.process(frame, now).map(FrameOutcome::Processed)
    }

    /// Evaluate one frame unconditionally.
    ///
    /// A detector or encoder failure leaves occupancy and the pending batch
    /// untouched.
    pub fn process(&mut self, frame: &RgbImage, now: Instant) -> Result<FrameReport, ProcessError> {
        let small = downscale(frame, self.resize_factor);
        let boxes = self.detector.detect(&small)?;

        let mut detections = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let encoding = self.encoder.encode(&small, &bbox)?;
            detections.push(Detection {
                bbox: bbox.scaled(1.0 / self.resize_factor),
                encoding,
            });
        }

        let results: Vec<MatchResult> = detections
            .into_iter()
            .map(|detection| {
                let identification = self.matcher.identify(&detection.encoding, &self.store);
                MatchResult::new(detection, identification)
            })
            .collect();

        for result in results.iter().filter(|r| r.is_intruder()) {
            tracing::debug!(distance = ?result.distance, "face matched no enrolled person");
            self.pending.push(frame.clone());
        }

        let event = self.tracker.observe(results.len(), now);
        match event {
            Some(OccupancyEvent::Entered) => {
                for result in &results {
                    tracing::info!(name = %result.label, "entered the room");
                }
            }
            Some(OccupancyEvent::Vacated) => tracing::info!("room is empty"),
            None => {}
        }

        let any_intruder = results.iter().any(|r| r.is_intruder());
        let alert = if any_intruder && !self.pending.is_empty() {
            let batch = AlertBatch::new(std::mem::take(&mut self.pending));
            let id = batch.id;
            tracing::warn!(
                batch = %id,
                snapshots = batch.images.len(),
                "intruder detected, dispatching alert"
            );
            self.sink.send_alert(batch);
            Some(id)
        } else {
            None
        };

        Ok(FrameReport {
            results,
            event,
            state: self.tracker.state(),
            alert,
        })
    }
}

fn downscale(frame: &RgbImage, factor: f32) -> Cow<'_, RgbImage> {
    if factor >= 1.0 {
        return Cow::Borrowed(frame);
    }
    let width = ((frame.width() as f32 * factor).round() as u32).max(1);
    let height = ((frame.height() as f32 * factor).round() as u32).max(1);
    Cow::Owned(imageops::resize(frame, width, height, FilterType::Triangle))
}

/// Encode the highest-confidence face in `image`, or `None` when there is no face.
pub fn encode_first_face<D: FaceDetect, E: FaceEncode>(
    detector: &mut D,
    encoder: &mut E,
    image: &RgbImage,
) -> Result<Option<Encoding>, ProcessError> {
    let boxes = detector.detect(image)?;
    let Some(first) = boxes.first() else {
        return Ok(None);
    };
    Ok(Some(encoder.encode(image, first)?))
}
