use crate::detect::backend::DetectionSink;
use crate::detect::result::Detections;
use crate::frame::FrameInfo;

/// Sink that logs every decoded barcode.
#[derive(Default)]
pub struct LoggingSink;

impl DetectionSink for LoggingSink {
    fn on_detections(&self, frame: &FrameInfo, detections: &Detections) {
        for barcode in &detections.barcodes {
            log::info!(
                "frame #{} t={}ms: {:?} {:?}",
                frame.sequence_id,
                frame.timestamp_ms,
                barcode.format,
                barcode.raw_value
            );
        }
    }
}
