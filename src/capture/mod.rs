//! Capture orchestration: the detection worker and the session that owns it.

pub mod session;
pub mod worker;

pub use session::{CaptureSession, SessionState, SessionStats};
pub use worker::{CaptureWorker, WorkerStats};
