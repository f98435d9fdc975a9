pub mod stub;

#[cfg(feature = "detect-qr")]
pub mod qr;

pub use stub::{StubDetector, StubProbe};

#[cfg(feature = "detect-qr")]
pub use qr::QrDetector;
