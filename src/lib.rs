//! Barcode capture pipeline
//!
//! Moves preview frames from a camera to a barcode detector without ever
//! stalling the camera's delivery thread.
//!
//! # Architecture
//!
//! The pipeline holds three properties by construction:
//!
//! 1. **Latest frame wins**: a single-slot mailbox sits between delivery and
//!    detection. A frame arriving while one is pending replaces it.
//! 2. **No buffer leaks**: every preview buffer goes back to the device
//!    after eviction or detection, including when the detector fails or panics.
//! 3. **Ordered lifecycle**: a session moves Idle -> Starting -> Running ->
//!    Stopping -> Idle, and Released is terminal.
//!
//! # Module Structure
//!
//! - `frame`: preview buffers, the buffer pool, frame descriptors, the frame slot
//! - `device`: camera capability trait, size/fps selection, rotation, devices
//! - `detect`: detector trait, detection results, detector backends
//! - `capture`: the detection worker and the capture session
//! - `config`: validated capture configuration, file and env loading
//! - `error`: error taxonomy

pub mod capture;
pub mod config;
pub mod detect;
pub mod device;
pub mod error;
pub mod frame;

pub use capture::{CaptureSession, CaptureWorker, SessionState, SessionStats, WorkerStats};
pub use config::{CaptureConfig, CaptureConfigBuilder, FlashMode, FocusMode};
#[cfg(feature = "detect-qr")]
pub use detect::QrDetector;
pub use detect::{
    Barcode, BarcodeFormat, DetectionSink, Detections, Detector, LoggingSink, StubDetector,
    StubProbe,
};
#[cfg(feature = "device-v4l2")]
pub use device::V4l2Camera;
pub use device::{
    BufferRecycler, CameraDevice, CameraInfo, DeviceCapabilities, FrameSink, SyntheticCamera,
    SyntheticConfig, SyntheticHandle,
};
pub use error::{CaptureError, CaptureResult};
pub use frame::{
    Facing, FrameBufferPool, FrameDescriptor, FrameInfo, FrameSlot, PixelFormat, PreviewBuffer,
    Rotation, Size,
};
