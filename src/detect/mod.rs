mod backend;
mod backends;
mod result;
mod sink;

pub use backend::{DetectionSink, Detector};
#[cfg(feature = "detect-qr")]
pub use backends::QrDetector;
pub use backends::{StubDetector, StubProbe};
pub use result::{Barcode, BarcodeFormat, Detections, Point};
pub use sink::LoggingSink;
