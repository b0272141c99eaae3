use std::sync::Arc;

use crate::camera::{FrameSource, SourceOpener};
use crate::camera_sources::HttpCameraSource;
use crate::error::TrackerError;

#[cfg(feature = "uvc")]
use crate::camera_sources::UvcCameraSource;

/// Resolves a camera identifier to an opener for the acquisition thread.
pub fn camera_source_from_uri(
    uri: &str,
    resolution: (u32, u32),
    fps: u32,
) -> Result<SourceOpener, TrackerError> {
    if uri.starts_with("http://") {
        let uri = uri.to_string();
        return Ok(Arc::new(move || {
            HttpCameraSource::connect(uri.clone(), resolution)
                .map(|source| Box::new(source) as Box<dyn FrameSource>)
        }));
    }

    if let Some(index) = uvc_index(uri) {
        #[cfg(feature = "uvc")]
        {
            return Ok(Arc::new(move || {
                UvcCameraSource::open(index, resolution, fps)
                    .map(|source| Box::new(source) as Box<dyn FrameSource>)
            }));
        }

        #[cfg(not(feature = "uvc"))]
        {
            let _ = (index, fps);
            return Err(TrackerError::Config(format!(
                "{uri}: compiled without UVC camera support"
            )));
        }
    }

    Err(TrackerError::Config(format!("Invalid camera URI {uri}")))
}

fn uvc_index(uri: &str) -> Option<u32> {
    uri.strip_prefix("uvc://")
        .or_else(|| uri.strip_prefix("/dev/video"))
        .and_then(|index| index.parse().ok())
}
