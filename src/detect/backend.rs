use anyhow::Result;

use crate::detect::result::Detections;
use crate::frame::{FrameDescriptor, FrameInfo};

/// Detection collaborator.
///
/// Called synchronously by the capture worker, once per processed frame.
/// The frame borrow ends with the call; implementations must not keep
/// pixel data beyond it.
pub trait Detector: Send {
    /// Detector identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// Errors (and panics) are treated as recoverable: the worker logs them,
    /// recycles the frame's buffer and moves on to the next frame.
    fn process(&mut self, frame: &FrameDescriptor) -> Result<Detections>;

    /// Free detector resources. Called exactly once, after the worker has exited.
    fn release(&mut self) {}
}

/// Receives detector output for each successfully processed frame.
pub trait DetectionSink: Send + Sync {
    fn on_detections(&self, frame: &FrameInfo, detections: &Detections);
}
