/// Output of one detection call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Detections {
    pub barcodes: Vec<Barcode>,
}

impl Detections {
    pub fn is_empty(&self) -> bool {
        self.barcodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.barcodes.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Barcode {
    pub format: BarcodeFormat,
    /// Decoded payload.
    pub raw_value: String,
    /// Corner points in frame pixel coordinates, clockwise from top-left.
    pub corners: [Point; 4],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarcodeFormat {
    QrCode,
    Unknown,
}
