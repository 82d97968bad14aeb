//! V4L2 camera capture via the `v4l` crate.
//!
//! A [`Camera`] is an open, format-negotiated device. Frames are pulled from a
//! [`PreviewStream`], which keeps the driver streaming between grabs so
//! periodic polling does not pay for stream setup on every frame.

use crate::frame::{self, Frame, PixelLayout};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Preview size asked of the driver; it may settle on something else.
const PREVIEW_WIDTH: u32 = 640;
const PREVIEW_HEIGHT: u32 = 480;
/// Kept small so a grab after an idle poll interval is close to live.
const STREAM_BUFFERS: u32 = 2;
const MAX_DEVICE_INDEX: u32 = 16;
/// Longest wait for the driver to hand back a filled buffer.
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("device cannot capture video")]
    StreamingNotSupported,
    #[error("camera stream released")]
    Released,
}

/// A V4L2 capture device found by [`Camera::list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Wire format the driver agreed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2, delivered to callers as RGB.
    Yuyv,
    /// 8-bit luma only.
    Grey,
    /// 16-bit little-endian luma, delivered as 8-bit.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }

    /// Unpack one raw driver buffer into a frame payload.
    fn unpack(self, buf: &[u8], width: u32, height: u32) -> Result<(Vec<u8>, PixelLayout), CameraError> {
        let unpacked = match self {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height).map(|d| (d, PixelLayout::Rgb8)),
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, width, height).map(|d| (d, PixelLayout::Gray8)),
            PixelFormat::Grey => {
                let pixels = width as usize * height as usize;
                return match buf.get(..pixels) {
                    Some(luma) => Ok((luma.to_vec(), PixelLayout::Gray8)),
                    None => Err(CameraError::CaptureFailed(format!(
                        "short GREY buffer: {} of {pixels} bytes",
                        buf.len()
                    ))),
                };
            }
        };
        unpacked.map_err(|e| CameraError::CaptureFailed(format!("{self:?} unpack failed: {e}")))
    }
}

/// Open, format-negotiated V4L2 device.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` (e.g. "/dev/video0") and negotiate a preview format.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        let device = open_device(device_path)?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("querying capabilities: {e}")))?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut wanted = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("reading format: {e}")))?;
        wanted.fourcc = FourCC::new(b"YUYV");
        wanted.width = PREVIEW_WIDTH;
        wanted.height = PREVIEW_HEIGHT;

        // Monochrome sensors answer a YUYV request with GREY or Y16.
        let agreed = device
            .set_format(&wanted)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("setting format: {e}")))?;
        let pixel_format = PixelFormat::from_fourcc(agreed.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "driver chose {:?}; only YUYV, GREY and Y16 are handled",
                agreed.fourcc
            ))
        })?;
        tracing::info!(
            width = agreed.width,
            height = agreed.height,
            format = ?pixel_format,
            "preview format agreed"
        );

        Ok(Self {
            device,
            width: agreed.width,
            height: agreed.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Start streaming. The driver keeps filling buffers until the returned
    /// stream is dropped.
    pub fn preview(&self) -> Result<PreviewStream<'_>, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| CameraError::CaptureFailed(format!("starting stream: {e}")))?;
        // A stalled driver otherwise blocks the dequeue, and the worker, forever.
        stream.set_timeout(FRAME_TIMEOUT);
        Ok(PreviewStream {
            camera: self,
            stream,
        })
    }

    /// Grab one frame on a short-lived stream.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        self.preview()?.next_frame()
    }

    /// Enumerate `/dev/video*` nodes that can capture video.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_DEVICE_INDEX)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(CapFlags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

fn open_device(device_path: &str) -> Result<Device, CameraError> {
    if !Path::new(device_path).exists() {
        return Err(CameraError::DeviceNotFound(device_path.to_string()));
    }
    Device::with_path(device_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            CameraError::PermissionDenied(device_path.to_string())
        } else if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
            // 16 = EBUSY
            CameraError::DeviceBusy
        } else {
            CameraError::DeviceNotFound(format!("{device_path}: {e}"))
        }
    })
}

/// Running capture stream on a [`Camera`].
pub struct PreviewStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl PreviewStream<'_> {
    /// Dequeue the next filled buffer and unpack it.
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut => CameraError::CaptureFailed(format!(
                    "no frame from driver within {FRAME_TIMEOUT:?}"
                )),
                _ => CameraError::CaptureFailed(format!("dequeuing buffer: {e}")),
            })?;
        let Camera { width, height, pixel_format, .. } = *self.camera;
        let (data, layout) = pixel_format.unpack(buf, width, height)?;

        Ok(Frame {
            data,
            width,
            height,
            layout,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }
}
