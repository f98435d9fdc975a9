//! Capture device capability interface.
//!
//! A `CameraDevice` is anything that can be opened for a facing, report what
//! it supports, accept negotiated settings, and then deliver frames into
//! preview buffers through a `FrameSink` until stopped. The session never
//! talks to a concrete camera API directly.
//!
//! Available devices:
//! - `SyntheticCamera` (`stub://` paths): in-process device for tests and demos
//! - `V4l2Camera` (feature: device-v4l2): local V4L2 capture node

pub mod rotation;
pub mod select;
pub mod synthetic;
#[cfg(feature = "device-v4l2")]
pub mod v4l2;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{FlashMode, FocusMode};
use crate::frame::{Facing, PixelFormat, PreviewBuffer, Rotation, Size};

pub use rotation::{compute_rotation, compute_zoom, CameraRotation};
pub use select::{
    negotiate, select_fps_range, select_size_pair, FpsRange, Negotiated, SizePair,
};
pub use synthetic::{SyntheticCamera, SyntheticConfig, SyntheticHandle};
#[cfg(feature = "device-v4l2")]
pub use v4l2::V4l2Camera;

/// Delivery callback. Invoked by the device on its own thread, once per frame.
pub type FrameSink = Arc<dyn Fn(PreviewBuffer) + Send + Sync>;

/// Return path for consumed buffers onto the device's callback queue.
///
/// Must be callable from any thread while the device is previewing.
pub trait BufferRecycler: Send + Sync {
    fn requeue(&self, buffer: PreviewBuffer);
}

/// Static description of an opened camera.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraInfo {
    pub id: String,
    pub facing: Facing,
    /// Clockwise angle the sensor image must be rotated to be upright.
    pub orientation: Rotation,
}

#[derive(Clone, Debug, Default)]
pub struct DeviceCapabilities {
    pub preview_sizes: Vec<Size>,
    pub picture_sizes: Vec<Size>,
    pub fps_ranges: Vec<FpsRange>,
    pub pixel_format: PixelFormat,
    pub focus_modes: Vec<FocusMode>,
    pub flash_modes: Vec<FlashMode>,
}

/// Settings applied to the device before preview starts.
#[derive(Clone, Debug, PartialEq)]
pub struct PreviewSettings {
    pub preview_size: Size,
    pub picture_size: Option<Size>,
    pub fps_range: FpsRange,
    pub format: PixelFormat,
    /// Rotation applied to captured stills.
    pub rotation: Rotation,
    /// Orientation for the on-screen preview (mirrored for front cameras).
    pub display_orientation: u32,
    pub focus_mode: Option<FocusMode>,
    pub flash_mode: Option<FlashMode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoomState {
    pub current: u32,
    pub max: u32,
}

pub trait CameraDevice: Send {
    /// Device identifier for logs.
    fn name(&self) -> String;

    /// Open the first camera with the requested facing.
    fn open(&mut self, facing: Facing) -> Result<CameraInfo>;

    /// What the opened camera supports.
    fn capabilities(&self) -> Result<DeviceCapabilities>;

    /// Closest-match preview size, picture size and fps range.
    fn negotiate(&self, desired: Size, desired_fps: f32) -> Result<Negotiated> {
        let caps = self.capabilities()?;
        negotiate(&caps, desired, desired_fps)
    }

    fn configure(&mut self, settings: &PreviewSettings) -> Result<()>;

    /// Where consumed buffers go. Valid for the lifetime of the device.
    fn recycler(&self) -> Arc<dyn BufferRecycler>;

    /// Queue `buffers` and start delivering frames to `sink`.
    fn start_preview(&mut self, sink: FrameSink, buffers: Vec<PreviewBuffer>) -> Result<()>;

    /// Stop delivery, detach the sink, and hand back every buffer still queued.
    ///
    /// No sink invocation may be in progress or start after this returns.
    fn stop_preview(&mut self) -> Result<Vec<PreviewBuffer>>;

    /// Current zoom, or `None` if the camera cannot zoom.
    fn zoom(&self) -> Option<ZoomState> {
        None
    }

    fn set_zoom(&mut self, _level: u32) -> Result<()> {
        Err(anyhow::anyhow!("zoom not supported by {}", self.name()))
    }

    /// Frames the device skipped because no buffer was queued.
    fn dropped_frames(&self) -> u64 {
        0
    }

    /// Close the camera. Safe to call when not open.
    fn release(&mut self);
}
