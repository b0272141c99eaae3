use std::f64::consts::PI;
use std::time::{Duration, SystemTime};

use one_euro_rs::OneEuroFilter;

use crate::camera::Frame;
use crate::config::{DetectorKind, DetectorSettings};
use crate::error::DetectError;
use crate::structs::{Ellipse, PupilSample, RegionOfInterest};

/// Assumed frame period when a detector has no previous timestamp.
const DEFAULT_FRAME_DELTA: Duration = Duration::from_millis(33);

/// Finds the pupil in one frame.
pub trait PupilDetector {
    /// `Ok(None)` when no pupil is visible in the region.
    fn detect(
        &mut self,
        frame: &Frame,
        roi: &RegionOfInterest,
    ) -> Result<Option<PupilSample>, DetectError>;
}

pub fn create_detector(kind: DetectorKind, settings: &DetectorSettings) -> Box<dyn PupilDetector> {
    match kind {
        DetectorKind::Ellipse2d => Box::new(Ellipse2dDetector::new(settings.clone())),
        DetectorKind::Temporal3d => Box::new(Temporal3dDetector::new(settings.clone())),
    }
}

/// Fits an ellipse to the darkest blob of the region from its second
/// moments.
pub struct Ellipse2dDetector {
    settings: DetectorSettings,
}

impl Ellipse2dDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self { settings }
    }
}

impl PupilDetector for Ellipse2dDetector {
    fn detect(
        &mut self,
        frame: &Frame,
        roi: &RegionOfInterest,
    ) -> Result<Option<PupilSample>, DetectError> {
        let (width, height) = frame.size();
        if roi.validate((width, height)).is_err() {
            return Err(DetectError::RoiOutsideFrame {
                roi: roi.as_tuple(),
                width,
                height,
            });
        }

        let pixels = &frame.pixels;
        let rows = roi.y..roi.y + roi.height;
        let cols = roi.x..roi.x + roi.width;

        let mut darkest = u8::MAX;
        for y in rows.clone() {
            for x in cols.clone() {
                darkest = darkest.min(pixels.get_pixel(x, y).0[0]);
            }
        }
        let threshold = darkest.saturating_add(self.settings.intensity_range);

        let (mut n, mut sx, mut sy, mut sxx, mut syy, mut sxy) = (0.0f64, 0.0, 0.0, 0.0, 0.0, 0.0);
        for y in rows {
            for x in cols.clone() {
                if pixels.get_pixel(x, y).0[0] > threshold {
                    continue;
                }
                let (px, py) = (x as f64 + 0.5, y as f64 + 0.5);
                n += 1.0;
                sx += px;
                sy += py;
                sxx += px * px;
                syy += py * py;
                sxy += px * py;
            }
        }

        // A pupil never fills most of the region, a uniform image would.
        let roi_area = roi.width as f64 * roi.height as f64;
        if n < 5.0 || n > 0.5 * roi_area {
            return Ok(None);
        }

        let (cx, cy) = (sx / n, sy / n);
        let var_x = sxx / n - cx * cx;
        let var_y = syy / n - cy * cy;
        let cov = sxy / n - cx * cy;

        let half_trace = (var_x + var_y) / 2.0;
        let spread = (((var_x - var_y) / 2.0).powi(2) + cov * cov).sqrt();
        let (l_major, l_minor) = (half_trace + spread, half_trace - spread);
        if l_minor <= 0.0 {
            return Err(DetectError::Degenerate);
        }

        // Uniform filled ellipse: variance along an axis is (axis / 4)^2.
        let major = 4.0 * l_major.sqrt();
        let minor = 4.0 * l_minor.sqrt();
        let diameter = major as f32;
        if diameter < self.settings.pupil_size_min || diameter > self.settings.pupil_size_max {
            return Ok(None);
        }

        let fill = n / (PI / 4.0 * major * minor);
        let confidence = fill.min(1.0 / fill).clamp(0.0, 1.0) as f32;
        let angle = (0.5 * (2.0 * cov).atan2(var_x - var_y)).to_degrees();

        Ok(Some(PupilSample {
            norm_pos: ((cx / width as f64) as f32, (1.0 - cy / height as f64) as f32),
            ellipse: Ellipse {
                center: (cx as f32, cy as f32),
                axes: (major as f32, minor as f32),
                angle: angle as f32,
            },
            diameter,
            confidence,
            timestamp: frame.timestamp,
        }))
    }
}

struct PupilFilters {
    x: OneEuroFilter,
    y: OneEuroFilter,
    diameter: OneEuroFilter,
    last_timestamp: SystemTime,
}

/// Ellipse fit whose position and size are one-euro filtered across frames,
/// keeping a model of the eye between detections.
pub struct Temporal3dDetector {
    inner: Ellipse2dDetector,
    filters: Option<PupilFilters>,
}

impl Temporal3dDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self {
            inner: Ellipse2dDetector::new(settings),
            filters: None,
        }
    }

    fn new_filters(&self, sample: &PupilSample) -> PupilFilters {
        let cutoff = self.inner.settings.smoothing_min_cutoff;
        let beta = self.inner.settings.smoothing_beta;
        PupilFilters {
            x: OneEuroFilter::new(sample.norm_pos.0, cutoff, cutoff, beta),
            y: OneEuroFilter::new(sample.norm_pos.1, cutoff, cutoff, beta),
            diameter: OneEuroFilter::new(sample.diameter, cutoff, cutoff, beta),
            last_timestamp: sample.timestamp,
        }
    }
}

impl PupilDetector for Temporal3dDetector {
    fn detect(
        &mut self,
        frame: &Frame,
        roi: &RegionOfInterest,
    ) -> Result<Option<PupilSample>, DetectError> {
        let Some(mut sample) = self.inner.detect(frame, roi)? else {
            // Lost the eye, start over on the next detection.
            self.filters = None;
            return Ok(None);
        };

        let mut filters = match self.filters.take() {
            Some(filters) => filters,
            None => self.new_filters(&sample),
        };

        let delta = sample
            .timestamp
            .duration_since(filters.last_timestamp)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_FRAME_DELTA)
            .as_secs_f32();

        let x = filters.x.filter_with_delta(sample.norm_pos.0, delta);
        let y = filters.y.filter_with_delta(sample.norm_pos.1, delta);
        let diameter = filters.diameter.filter_with_delta(sample.diameter, delta);
        filters.last_timestamp = sample.timestamp;

        let (width, height) = frame.size();
        let scale = if sample.diameter > 0.0 {
            diameter / sample.diameter
        } else {
            1.0
        };
        sample.norm_pos = (x, y);
        sample.ellipse.center = (x * width as f32, (1.0 - y) * height as f32);
        sample.ellipse.axes = (sample.ellipse.axes.0 * scale, sample.ellipse.axes.1 * scale);
        sample.diameter = diameter;

        self.filters = Some(filters);
        Ok(Some(sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn disk_frame(size: (u32, u32), center: (f32, f32), radius: f32) -> Frame {
        let pixels = GrayImage::from_fn(size.0, size.1, |x, y| {
            let dx = x as f32 + 0.5 - center.0;
            let dy = y as f32 + 0.5 - center.1;
            if dx * dx + dy * dy <= radius * radius {
                Luma([20])
            } else {
                Luma([200])
            }
        });
        Frame::new(pixels, SystemTime::now(), 0)
    }

    #[test]
    fn finds_dark_disk() {
        let frame = disk_frame((160, 120), (70.0, 50.0), 30.0);
        let roi = RegionOfInterest::full_frame(frame.size());
        let sample = Ellipse2dDetector::new(DetectorSettings::default())
            .detect(&frame, &roi)
            .unwrap()
            .unwrap();

        assert!((sample.ellipse.center.0 - 70.0).abs() < 0.5);
        assert!((sample.ellipse.center.1 - 50.0).abs() < 0.5);
        assert!((sample.diameter - 60.0).abs() < 2.0);
        assert!((sample.norm_pos.0 - 70.0 / 160.0).abs() < 0.01);
        assert!((sample.norm_pos.1 - (1.0 - 50.0 / 120.0)).abs() < 0.01);
        assert!(sample.confidence > 0.9, "{}", sample.confidence);
    }

    #[test]
    fn uniform_frame_has_no_pupil() {
        let frame = Frame::new(GrayImage::from_pixel(64, 64, Luma([90])), SystemTime::now(), 0);
        let roi = RegionOfInterest::full_frame(frame.size());
        let found = Ellipse2dDetector::new(DetectorSettings::default())
            .detect(&frame, &roi)
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn pupil_outside_region_is_not_found() {
        let frame = disk_frame((160, 120), (40.0, 60.0), 30.0);
        // Region only covers the bright right half.
        let roi = RegionOfInterest::new(100, 0, 60, 120);
        let found = Ellipse2dDetector::new(DetectorSettings::default())
            .detect(&frame, &roi)
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn region_larger_than_frame_is_an_error() {
        let frame = disk_frame((160, 120), (70.0, 50.0), 30.0);
        let roi = RegionOfInterest::new(0, 0, 640, 480);
        let mut detector = create_detector(DetectorKind::Temporal3d, &DetectorSettings::default());
        assert!(matches!(
            detector.detect(&frame, &roi),
            Err(DetectError::RoiOutsideFrame { .. })
        ));
    }

    #[test]
    fn temporal_detector_tracks_a_still_pupil() {
        let mut detector = Temporal3dDetector::new(DetectorSettings::default());
        let roi = RegionOfInterest::full_frame((160, 120));
        let mut last = None;
        for _ in 0..5 {
            let frame = disk_frame((160, 120), (80.0, 60.0), 30.0);
            last = detector.detect(&frame, &roi).unwrap();
        }
        let sample = last.unwrap();
        assert!((sample.norm_pos.0 - 0.5).abs() < 0.01);
        assert!((sample.norm_pos.1 - 0.5).abs() < 0.01);
    }
}
