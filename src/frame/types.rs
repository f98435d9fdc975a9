//! Frame metadata and descriptor types.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::pool::PreviewBuffer;
use crate::error::CaptureError;

// ----------------------------------------------------------------------------
// Geometry and orientation
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Which way the camera faces relative to the screen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    #[default]
    Back,
    Front,
}

impl FromStr for Facing {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "back" => Ok(Facing::Back),
            "front" => Ok(Facing::Front),
            other => Err(CaptureError::config(format!(
                "invalid facing camera: {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facing::Back => f.write_str("back"),
            Facing::Front => f.write_str("front"),
        }
    }
}

/// Clockwise rotation in quarter turns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Accepts any multiple of 90, normalised into 0..360.
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

// ----------------------------------------------------------------------------
// Pixel formats
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    /// YCrCb 4:2:0, full luma plane followed by interleaved VU.
    #[default]
    Nv21,
    /// Packed YUV 4:2:2.
    Yuyv,
    /// Packed 8-bit RGB.
    Rgb24,
}

impl PixelFormat {
    pub fn bits_per_pixel(self) -> u64 {
        match self {
            PixelFormat::Nv21 => 12,
            PixelFormat::Yuyv => 16,
            PixelFormat::Rgb24 => 24,
        }
    }

    /// Bytes needed for one preview buffer of `size`, plus one byte of slack.
    pub fn buffer_len(self, size: Size) -> Option<usize> {
        let bits = u64::from(size.width)
            .checked_mul(u64::from(size.height))?
            .checked_mul(self.bits_per_pixel())?;
        let bytes = bits.div_ceil(8).checked_add(1)?;
        usize::try_from(bytes).ok()
    }

    /// Luma sample at (x, y), for formats that carry one.
    pub fn luma(self, data: &[u8], width: usize, x: usize, y: usize) -> u8 {
        let idx = match self {
            PixelFormat::Nv21 => y * width + x,
            PixelFormat::Yuyv => (y * width + x) * 2,
            PixelFormat::Rgb24 => {
                let base = (y * width + x) * 3;
                let (r, g, b) = (
                    u32::from(data.get(base).copied().unwrap_or(0)),
                    u32::from(data.get(base + 1).copied().unwrap_or(0)),
                    u32::from(data.get(base + 2).copied().unwrap_or(0)),
                );
                return ((r * 299 + g * 587 + b * 114) / 1000) as u8;
            }
        };
        data.get(idx).copied().unwrap_or(0)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Nv21 => f.write_str("NV21"),
            PixelFormat::Yuyv => f.write_str("YUYV"),
            PixelFormat::Rgb24 => f.write_str("RGB3"),
        }
    }
}

// ----------------------------------------------------------------------------
// FrameDescriptor
// ----------------------------------------------------------------------------

/// Metadata for one delivered frame, without the pixel payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    /// Monotonically increasing, starting at 1 for each run.
    pub sequence_id: u64,
    /// Milliseconds since the run started.
    pub timestamp_ms: u64,
    pub size: Size,
    pub format: PixelFormat,
    pub rotation: Rotation,
}

/// A delivered frame: metadata plus exclusive ownership of its preview buffer.
///
/// Detectors only ever see `&FrameDescriptor`, so the payload cannot outlive
/// the detection call. Afterwards the worker hands the buffer back to the pool.
pub struct FrameDescriptor {
    info: FrameInfo,
    payload: PreviewBuffer,
}

impl FrameDescriptor {
    pub(crate) fn new(info: FrameInfo, payload: PreviewBuffer) -> Self {
        Self { info, payload }
    }

    pub fn info(&self) -> FrameInfo {
        self.info
    }

    pub fn sequence_id(&self) -> u64 {
        self.info.sequence_id
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.info.timestamp_ms
    }

    pub fn width(&self) -> u32 {
        self.info.size.width
    }

    pub fn height(&self) -> u32 {
        self.info.size.height
    }

    pub fn format(&self) -> PixelFormat {
        self.info.format
    }

    pub fn rotation(&self) -> Rotation {
        self.info.rotation
    }

    pub fn data(&self) -> &[u8] {
        self.payload.as_slice()
    }

    pub(crate) fn payload(&self) -> &PreviewBuffer {
        &self.payload
    }

    pub(crate) fn into_payload(self) -> PreviewBuffer {
        self.payload
    }
}

impl fmt::Debug for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDescriptor")
            .field("info", &self.info)
            .field("buffer", &self.payload.id())
            .finish()
    }
}

/// Stamps sequence ids and capture timestamps onto delivered buffers.
///
/// One tagger per run; the rotation and size it stamps are fixed at start.
pub(crate) struct FrameTagger {
    epoch: Instant,
    next_id: AtomicU64,
    size: Size,
    format: PixelFormat,
    rotation: Rotation,
}

impl FrameTagger {
    pub(crate) fn new(size: Size, format: PixelFormat, rotation: Rotation) -> Self {
        Self {
            epoch: Instant::now(),
            next_id: AtomicU64::new(1),
            size,
            format,
            rotation,
        }
    }

    pub(crate) fn tag(&self, payload: PreviewBuffer) -> FrameDescriptor {
        let sequence_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timestamp_ms = self.epoch.elapsed().as_millis() as u64;
        FrameDescriptor::new(
            FrameInfo {
                sequence_id,
                timestamp_ms,
                size: self.size,
                format: self.format,
                rotation: self.rotation,
            },
            payload,
        )
    }

    /// Frames tagged so far.
    pub(crate) fn delivered(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv21_buffer_len_matches_preview_layout() {
        // 640 * 480 * 12 / 8 = 460800, plus one byte
        assert_eq!(
            PixelFormat::Nv21.buffer_len(Size::new(640, 480)),
            Some(460_801)
        );
        assert_eq!(PixelFormat::Nv21.buffer_len(Size::new(3, 1)), Some(6));
    }

    #[test]
    fn rotation_accepts_only_quarter_turns() {
        assert_eq!(Rotation::from_degrees(450), Some(Rotation::Deg90));
        assert_eq!(Rotation::from_degrees(45), None);
        assert_eq!(Rotation::Deg270.degrees(), 270);
    }

    #[test]
    fn facing_parses_case_insensitively() {
        assert_eq!("Front".parse::<Facing>().unwrap(), Facing::Front);
        assert!(matches!(
            "sideways".parse::<Facing>(),
            Err(CaptureError::Configuration(_))
        ));
    }

    #[test]
    fn rgb_luma_weights_channels() {
        let data = [255u8, 255, 255, 0, 0, 0];
        assert_eq!(PixelFormat::Rgb24.luma(&data, 2, 0, 0), 255);
        assert_eq!(PixelFormat::Rgb24.luma(&data, 2, 1, 0), 0);
    }
}
