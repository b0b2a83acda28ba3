//! roomwatch-hw: webcam capture.
//!
//! Provides V4L2 camera access with YUYV, MJPEG and RGB24 frames all
//! delivered as RGB images.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, FrameSource, FrameStream, PixelFormat};
pub use frame::{Frame, FrameError};
