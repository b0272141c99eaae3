use std::io::Cursor;
use std::sync::Arc;
use std::time::SystemTime;

use image::GrayImage;

use crate::error::TrackerError;

pub struct Frame {
    pub pixels: GrayImage,
    /// Original compressed payload, if the camera delivered JPEG.
    pub raw_jpeg_data: Option<Vec<u8>>,
    pub timestamp: SystemTime,
    pub index: u64,
}

impl Frame {
    pub fn new(pixels: GrayImage, timestamp: SystemTime, index: u64) -> Self {
        Self {
            pixels,
            raw_jpeg_data: None,
            timestamp,
            index,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }
}

pub fn decode_jpeg(buf: &[u8]) -> Option<GrayImage> {
    let mut decoder = image::ImageReader::new(Cursor::new(buf));
    decoder.set_format(image::ImageFormat::Jpeg);

    match decoder.decode() {
        Ok(image) => Some(image.into_luma8()),
        Err(err) => {
            log::warn!("Failed to decode image: {err}");
            None
        }
    }
}

/// A camera. Acquisition blocks until the next frame is ready.
pub trait FrameSource {
    fn resolution(&self) -> (u32, u32);

    /// `Ok(None)` is a dropped frame, `Err` means the device is gone.
    fn next_frame(&mut self) -> Result<Option<Frame>, TrackerError>;
}

/// Opens the camera. Called on the acquisition thread, so sources need not
/// be `Send`.
pub type SourceOpener = Arc<dyn Fn() -> Result<Box<dyn FrameSource>, TrackerError> + Send + Sync>;
