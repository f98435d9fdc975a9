#![cfg(feature = "detect-qr")]

use anyhow::{anyhow, Result};

use crate::detect::backend::Detector;
use crate::detect::result::{Barcode, BarcodeFormat, Detections, Point};
use crate::frame::FrameDescriptor;

/// QR code detector built on rqrr.
///
/// Works on the luma channel of the preview frame, so no colour conversion
/// is needed for NV21 or YUYV buffers.
#[derive(Default)]
pub struct QrDetector {
    frames: u64,
}

impl QrDetector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Detector for QrDetector {
    fn name(&self) -> &'static str {
        "qr"
    }

    fn process(&mut self, frame: &FrameDescriptor) -> Result<Detections> {
        self.frames += 1;
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        let format = frame.format();
        let data = frame.data();

        let luma_len = width
            .checked_mul(height)
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() < luma_len {
            return Err(anyhow!(
                "expected at least {} luma bytes, received {}",
                luma_len,
                data.len()
            ));
        }

        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(width, height, |x, y| {
            format.luma(data, width, x, y)
        });
        let grids = prepared.detect_grids();

        let mut barcodes = Vec::with_capacity(grids.len());
        for grid in grids {
            match grid.decode() {
                Ok((_meta, content)) => {
                    let corners = grid.bounds.map(|p| Point { x: p.x, y: p.y });
                    log::debug!(
                        "QrDetector: frame #{} decoded {} bytes",
                        frame.sequence_id(),
                        content.len()
                    );
                    barcodes.push(Barcode {
                        format: BarcodeFormat::QrCode,
                        raw_value: content,
                        corners,
                    });
                }
                Err(err) => {
                    log::trace!(
                        "QrDetector: frame #{} grid failed to decode: {}",
                        frame.sequence_id(),
                        err
                    );
                }
            }
        }
        Ok(Detections { barcodes })
    }

    fn release(&mut self) {
        log::debug!("QrDetector: released after {} frames", self.frames);
    }
}
