//! Error taxonomy for the capture pipeline.
//!
//! Start/Stop/Release and construction surface `CaptureError`. Collaborator
//! code (detectors, config IO, binaries) works in `anyhow::Result` and is
//! folded into the matching variant at the boundary.

use thiserror::Error;

pub type CaptureResult<T> = Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Invalid fps, preview size, facing or mode. Fatal to the call only.
    #[error("invalid capture configuration: {0}")]
    Configuration(String),

    /// No matching camera, open failure, or size/fps negotiation failure.
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),

    /// The preview buffer layout could not be allocated.
    #[error("preview buffer allocation failed: {0}")]
    BufferAllocation(String),

    /// The detection collaborator failed on a frame. Never fatal to the worker.
    #[error("detection failed on frame {sequence_id}: {message}")]
    Detection { sequence_id: u64, message: String },

    /// The worker thread could not be spawned or did not exit cleanly.
    #[error("worker thread lifecycle error: {0}")]
    ThreadLifecycle(String),

    /// Operation not allowed in the session's current state.
    #[error("operation not allowed while session is {0}")]
    InvalidState(&'static str),
}

impl CaptureError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn device(message: impl Into<String>) -> Self {
        Self::DeviceUnavailable(message.into())
    }

    pub(crate) fn device_from(err: anyhow::Error) -> Self {
        Self::DeviceUnavailable(format!("{:#}", err))
    }
}
