//! facegate-hw — Camera capture and frame encoding.
//!
//! Provides V4L2-based camera access and conversion of captured frames to
//! the JPEG data URLs the attendance server accepts.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError, PixelLayout};
