//! V4L2 webcam capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("video capture not supported")]
    CaptureNotSupported,
    #[error("{format:?} frame conversion failed: {source}")]
    Conversion {
        format: PixelFormat,
        #[source]
        source: FrameError,
    },
}

impl CameraError {
    /// A single bad buffer; the stream itself is still usable.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, CameraError::Conversion { .. })
    }
}

/// Anything that yields RGB frames one at a time.
pub trait FrameSource {
    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame, CameraError>;

    /// Read and drop `count` frames.
    fn discard(&mut self, count: usize) {
        for _ in 0..count {
            if let Err(e) = self.next_frame() {
                tracing::debug!(error = %e, "warmup frame dropped");
            }
        }
    }
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, converted with BT.601.
    Yuyv,
    /// Motion JPEG, one JPEG per buffer.
    Mjpeg,
    /// Packed 24-bit RGB.
    Rgb3,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            b"RGB3" => Some(Self::Rgb3),
            _ => None,
        }
    }
}

/// Formats requested in order until the driver accepts one.
const PREFERRED_FORMATS: [&[u8; 4]; 3] = [b"YUYV", b"MJPG", b"RGB3"];

const STREAM_BUFFERS: u32 = 4;

/// V4L2 camera device handle. The device is released on drop.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera (e.g. "/dev/video0") and negotiate the closest
    /// supported format to `width`×`height`.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::CaptureNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        let mut negotiated = None;
        for wanted in PREFERRED_FORMATS {
            fmt.fourcc = FourCC::new(wanted);
            fmt.width = width;
            fmt.height = height;

            let got = device.set_format(&fmt).map_err(|e| {
                CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
            })?;
            if let Some(pixel_format) = PixelFormat::from_fourcc(got.fourcc) {
                negotiated = Some((got, pixel_format));
                break;
            }
            tracing::debug!(requested = ?FourCC::new(wanted), got = ?got.fourcc, "format rejected");
        }

        let Some((negotiated, pixel_format)) = negotiated else {
            return Err(CameraError::FormatNegotiationFailed(
                "driver offers none of YUYV, MJPG or RGB3".into(),
            ));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc: negotiated.fourcc,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Start streaming. Frames are dequeued from memory-mapped buffers until
    /// the stream is dropped.
    pub fn stream(&self) -> Result<FrameStream<'_>, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        Ok(FrameStream {
            camera: self,
            stream,
        })
    }

    fn buf_to_rgb(&self, buf: &[u8]) -> Result<image::RgbImage, CameraError> {
        buf_to_rgb(self.pixel_format, self.width, self.height, buf)
    }
}

/// Convert a raw buffer to RGB based on the negotiated format.
fn buf_to_rgb(
    format: PixelFormat,
    width: u32,
    height: u32,
    buf: &[u8],
) -> Result<image::RgbImage, CameraError> {
    let converted = match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
        PixelFormat::Mjpeg => frame::decode_mjpeg(buf),
        PixelFormat::Rgb3 => frame::rgb24_to_rgb(buf, width, height),
    };
    converted.map_err(|source| CameraError::Conversion { format, source })
}

/// An active capture stream borrowing its [`Camera`].
pub struct FrameStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl FrameSource for FrameStream<'_> {
    /// Dequeue and convert one buffer. A buffer that fails to convert yields
    /// [`CameraError::Conversion`]; a failed dequeue yields
    /// [`CameraError::CaptureFailed`].
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = if used > 0 { &buf[..used] } else { buf };
        let sequence = meta.sequence;

        let image = self.camera.buf_to_rgb(data)?;
        Ok(Frame {
            image,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    /// Dequeue and drop `count` buffers without converting them, e.g. while
    /// auto-exposure settles.
    fn discard(&mut self, count: usize) {
        for _ in 0..count {
            if let Err(e) = self.stream.next() {
                tracing::debug!(error = %e, "warmup frame dropped");
            }
        }
    }
}
