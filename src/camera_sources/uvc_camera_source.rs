use std::time::SystemTime;

use nokhwa::utils::CameraFormat;
use nokhwa::{
    pixel_format::RgbFormat,
    utils::{CameraIndex, RequestedFormat, RequestedFormatType},
};

use crate::camera::{Frame, FrameSource, decode_jpeg};
use crate::error::TrackerError;

/// Consecutive read errors before the camera is considered disconnected.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 30;

pub struct UvcCameraSource {
    camera: nokhwa::Camera,
    resolution: (u32, u32),
    next_index: u64,
    read_errors: u32,
}

impl UvcCameraSource {
    pub fn open(uvc_index: u32, resolution: (u32, u32), fps: u32) -> Result<Self, TrackerError> {
        let index = CameraIndex::Index(uvc_index);
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Exact(
            CameraFormat::new_from(
                resolution.0,
                resolution.1,
                nokhwa::utils::FrameFormat::MJPEG,
                fps,
            ),
        ));
        log::debug!("Requested format: {requested:?}");

        let mut camera = nokhwa::Camera::new(index, requested)
            .map_err(|e| TrackerError::Device(format!("uvc://{uvc_index}: {e}")))?;
        camera
            .open_stream()
            .map_err(|e| TrackerError::Device(format!("uvc://{uvc_index}: {e}")))?;

        let actual = camera.resolution();
        let actual = (actual.width(), actual.height());
        if actual != resolution {
            return Err(TrackerError::Device(format!(
                "uvc://{uvc_index} opened at {actual:?} instead of {resolution:?}"
            )));
        }

        log::info!(
            "Connected to a UVC camera fps:{} {:?}",
            camera.frame_rate(),
            camera.frame_format()
        );

        Ok(Self {
            camera,
            resolution,
            next_index: 0,
            read_errors: 0,
        })
    }
}

impl FrameSource for UvcCameraSource {
    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, TrackerError> {
        let frame_raw = match self.camera.frame_raw() {
            Ok(raw) => {
                self.read_errors = 0;
                raw
            }
            Err(err) => {
                self.read_errors += 1;
                if self.read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    return Err(TrackerError::Device(format!(
                        "camera stopped delivering frames: {err}"
                    )));
                }
                log::warn!("Camera read failed: {err}");
                return Ok(None);
            }
        };
        let timestamp = SystemTime::now();

        let Some(pixels) = decode_jpeg(&frame_raw) else {
            return Ok(None);
        };

        let mut frame = Frame::new(pixels, timestamp, self.next_index);
        frame.raw_jpeg_data = Some(Vec::from(frame_raw));
        self.next_index += 1;
        Ok(Some(frame))
    }
}
