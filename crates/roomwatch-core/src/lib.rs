//! roomwatch-core: face matching and room-occupancy decisions.
//!
//! SCRFD detection and ArcFace encoding run via ONNX Runtime; the frame
//! processor turns their output into occupancy events and intruder alerts.

pub mod alert;
pub mod alignment;
pub mod annotate;
pub mod config;
pub mod detector;
pub mod occupancy;
pub mod processor;
pub mod recognizer;
pub mod store;
pub mod types;

pub use alert::{AlertBatch, AlertSink, Classification};
pub use config::{Config, ConfigError, TelegramSettings};
pub use detector::{FaceDetect, FaceDetector};
pub use occupancy::{OccupancyEvent, OccupancyTracker, RoomState};
pub use processor::{FrameOutcome, FrameProcessor, FrameReport, ProcessError, ProcessorSettings};
pub use recognizer::{FaceEncode, FaceRecognizer};
pub use store::{DeleteOutcome, EnrollOutcome, KnownPerson, KnownStore, StoreError};
pub use types::{BoundingBox, Detection, Encoding, FirstMatch, Label, MatchResult, Matcher};
