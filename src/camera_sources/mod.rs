use std::time::SystemTime;

#[cfg(feature = "uvc")]
mod uvc_camera_source;
#[cfg(feature = "uvc")]
pub use uvc_camera_source::UvcCameraSource;

mod http_camera_source;
pub use http_camera_source::HttpCameraSource;

#[derive(Clone, Debug)]
pub(crate) struct FpsCounter {
    last_second: SystemTime,
    frames_since_last_second: u32,
}

impl FpsCounter {
    pub(crate) fn new() -> Self {
        Self {
            last_second: SystemTime::now(),
            frames_since_last_second: 0,
        }
    }

    pub(crate) fn update_fps(&mut self) {
        let now = SystemTime::now();
        let elapsed = now.duration_since(self.last_second).unwrap_or_default();
        if elapsed.as_secs() > 0 {
            log::debug!("FPS: {}", self.frames_since_last_second);

            self.last_second = now;
            self.frames_since_last_second = 0;
        }

        self.frames_since_last_second += 1;
    }
}
