use crate::presentation::{Color, PresentationSurface};
use crate::structs::{GazePoint, PupilSample, RegionOfInterest};
use crate::tracker::EyeTracker;

/// Gaze cursor on the control display, an outline ring.
#[derive(Clone, Debug)]
pub struct GazeOverlay {
    pub radius: f32,
    pub color: Color,
}

impl Default for GazeOverlay {
    fn default() -> Self {
        Self {
            radius: 30.0,
            color: [255, 0, 0],
        }
    }
}

impl GazeOverlay {
    /// Centred pixel position of `gaze` on a `size` display.
    pub fn position(gaze: GazePoint, (width, height): (u32, u32)) -> Option<(f32, f32)> {
        if !gaze.is_finite() {
            return None;
        }
        Some((gaze.x / 2.0 * width as f32, gaze.y / 2.0 * height as f32))
    }

    /// Returns whether anything was drawn.
    pub fn draw(&self, tracker: &dyn EyeTracker, surface: &mut dyn PresentationSurface) -> bool {
        let Some(center) = tracker
            .gaze()
            .and_then(|gaze| Self::position(gaze, surface.size()))
        else {
            return false;
        };
        surface.draw_ellipse(center, (self.radius, self.radius), 0.0, self.color);
        true
    }
}

/// Eye camera monitor: the search region and the fitted pupil ellipse,
/// with the camera image fitted into the surface.
#[derive(Clone, Debug)]
pub struct PupilOverlay {
    pub roi_color: Color,
    pub pupil_color: Color,
}

impl Default for PupilOverlay {
    fn default() -> Self {
        Self {
            roi_color: [255, 255, 0],
            pupil_color: [0, 255, 0],
        }
    }
}

/// Camera pixels (y down) to centred surface pixels (y up).
struct CameraView {
    camera: (f32, f32),
    scale: f32,
}

impl CameraView {
    fn new((cw, ch): (u32, u32), (sw, sh): (u32, u32)) -> Self {
        let (cw, ch) = (cw.max(1) as f32, ch.max(1) as f32);
        Self {
            camera: (cw, ch),
            scale: (sw as f32 / cw).min(sh as f32 / ch),
        }
    }

    fn point(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            (x - self.camera.0 / 2.0) * self.scale,
            (self.camera.1 / 2.0 - y) * self.scale,
        )
    }
}

impl PupilOverlay {
    /// Draws the region, then the pupil of `sample` if one was found.
    /// Returns whether a pupil was drawn.
    pub fn draw(
        &self,
        sample: Option<&PupilSample>,
        roi: RegionOfInterest,
        camera: (u32, u32),
        surface: &mut dyn PresentationSurface,
    ) -> bool {
        let view = CameraView::new(camera, surface.size());

        let (x, y, w, h) = roi.as_tuple();
        let roi_center = view.point((x as f32 + w as f32 / 2.0, y as f32 + h as f32 / 2.0));
        surface.draw_rect(
            roi_center,
            (w as f32 * view.scale, h as f32 * view.scale),
            self.roi_color,
        );

        let Some(sample) = sample.filter(|sample| sample.confidence > 0.0) else {
            return false;
        };
        let ellipse = &sample.ellipse;
        let semi_axes = (
            ellipse.axes.0 / 2.0 * view.scale,
            ellipse.axes.1 / 2.0 * view.scale,
        );
        // Camera y points down, so the rotation flips.
        surface.draw_ellipse(view.point(ellipse.center), semi_axes, -ellipse.angle, self.pupil_color);
        true
    }

    pub fn draw_tracker(&self, tracker: &dyn EyeTracker, surface: &mut dyn PresentationSurface) -> bool {
        let sample = tracker.latest_sample();
        self.draw(
            sample.as_ref(),
            tracker.region_of_interest(),
            tracker.frame_size(),
            surface,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::SystemTime;

    use super::*;
    use crate::config::TrackerConfig;
    use crate::engine::InProcessTracker;
    use crate::error::TrackerError;
    use crate::presentation::{BLACK, CanvasSurface};
    use crate::structs::Ellipse;

    #[test]
    fn screen_corners() {
        let size = (800, 600);
        assert_eq!(
            GazeOverlay::position(GazePoint::new(1.0, -1.0), size),
            Some((400.0, -300.0))
        );
        assert_eq!(
            GazeOverlay::position(GazePoint::new(0.0, 0.0), size),
            Some((0.0, 0.0))
        );
        assert_eq!(
            GazeOverlay::position(GazePoint::new(f32::INFINITY, 0.0), size),
            None
        );
    }

    #[test]
    fn uncalibrated_tracker_draws_nothing() {
        let tracker = InProcessTracker::new(
            TrackerConfig::default(),
            Arc::new(|| Err(TrackerError::Device("unused".to_string()))),
        )
        .unwrap();
        assert_eq!(tracker.gaze(), None);

        let mut canvas = CanvasSurface::new(80, 60);
        canvas.clear(BLACK);
        assert!(!GazeOverlay::default().draw(&tracker, &mut canvas));
        assert!(canvas.image().pixels().all(|p| p.0 == BLACK));
    }

    fn sample(confidence: f32) -> PupilSample {
        PupilSample {
            ellipse: Ellipse {
                center: (32.0, 24.0),
                axes: (16.0, 8.0),
                angle: 0.0,
            },
            confidence,
            ..PupilSample::not_found(SystemTime::now())
        }
    }

    #[test]
    fn roi_and_pupil_scaled_to_the_surface() {
        let overlay = PupilOverlay::default();
        let roi = RegionOfInterest::new(8, 8, 48, 32);
        let mut canvas = CanvasSurface::new(200, 150);
        canvas.clear(BLACK);

        assert!(overlay.draw(Some(&sample(0.9)), roi, (64, 48), &mut canvas));
        assert_eq!(canvas.pixel_at((-74.5, 0.0)), Some(overlay.roi_color));
        assert_eq!(canvas.pixel_at((-70.0, 0.0)), Some(BLACK));
        assert_eq!(canvas.pixel_at((25.0, 0.0)), Some(overlay.pupil_color));
        assert_eq!(canvas.pixel_at((0.0, 12.5)), Some(overlay.pupil_color));
        assert_eq!(canvas.pixel_at((0.0, 0.0)), Some(BLACK));
    }

    #[test]
    fn missed_pupil_draws_only_the_region() {
        let overlay = PupilOverlay::default();
        let roi = RegionOfInterest::new(8, 8, 48, 32);
        let mut canvas = CanvasSurface::new(200, 150);
        canvas.clear(BLACK);

        assert!(!overlay.draw(Some(&sample(0.0)), roi, (64, 48), &mut canvas));
        assert!(!overlay.draw(None, roi, (64, 48), &mut canvas));
        assert_eq!(canvas.pixel_at((-74.5, 0.0)), Some(overlay.roi_color));
        assert_eq!(canvas.pixel_at((25.0, 0.0)), Some(BLACK));
    }
}
