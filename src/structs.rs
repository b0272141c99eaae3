use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::TrackerError;

pub fn unix_seconds(timestamp: SystemTime) -> f64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn from_unix_seconds(secs: f64) -> SystemTime {
    match Duration::try_from_secs_f64(secs) {
        Ok(d) => SystemTime::UNIX_EPOCH + d,
        Err(_) => SystemTime::now(),
    }
}

/// Pupil outline in camera pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ellipse {
    pub center: (f32, f32),
    /// Full axis lengths, major first.
    pub axes: (f32, f32),
    /// Degrees, counter-clockwise from the image x axis.
    pub angle: f32,
}

/// One detector output.
///
/// `norm_pos` is image-normalised, `[0, 1]` on both axes with the origin at
/// the bottom-left corner of the frame.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PupilSample {
    pub norm_pos: (f32, f32),
    pub ellipse: Ellipse,
    pub diameter: f32,
    pub confidence: f32,
    pub timestamp: SystemTime,
}

impl PupilSample {
    pub fn not_found(timestamp: SystemTime) -> Self {
        Self {
            norm_pos: (0.0, 0.0),
            ellipse: Ellipse::default(),
            diameter: 0.0,
            confidence: 0.0,
            timestamp,
        }
    }

    pub fn is_found(&self) -> bool {
        self.confidence > 0.0
    }
}

/// Gaze in centred screen units, the screen spans `[-1, 1]` on both axes.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GazePoint {
    pub x: f32,
    pub y: f32,
}

impl GazePoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Where the subject was asked to look, in the same units as [`GazePoint`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ReferenceTarget {
    pub position: (f32, f32),
    pub timestamp: SystemTime,
    pub site: usize,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CalibrationPair {
    pub pupil: PupilSample,
    pub reference: ReferenceTarget,
}

#[derive(Clone, Debug, Default)]
pub struct CalibrationDataset {
    pairs: Vec<CalibrationPair>,
}

impl CalibrationDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pupil: PupilSample, reference: ReferenceTarget) {
        self.pairs.push(CalibrationPair { pupil, reference });
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[CalibrationPair] {
        &self.pairs
    }
}

impl FromIterator<CalibrationPair> for CalibrationDataset {
    fn from_iter<I: IntoIterator<Item = CalibrationPair>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

/// Sub-rectangle of the camera frame searched for the pupil.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionOfInterest {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full_frame((width, height): (u32, u32)) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn validate(&self, (frame_w, frame_h): (u32, u32)) -> Result<(), TrackerError> {
        if self.width == 0 || self.height == 0 {
            return Err(TrackerError::Config(format!(
                "region of interest {self:?} has zero area"
            )));
        }
        let right = self.x.checked_add(self.width);
        let bottom = self.y.checked_add(self.height);
        match (right, bottom) {
            (Some(r), Some(b)) if r <= frame_w && b <= frame_h => Ok(()),
            _ => Err(TrackerError::Config(format!(
                "region of interest {self:?} exceeds the {frame_w}x{frame_h} frame"
            ))),
        }
    }

    pub fn as_tuple(&self) -> (u32, u32, u32, u32) {
        (self.x, self.y, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roi_rejects_zero_area_and_overflow() {
        let frame = (640, 480);
        assert!(RegionOfInterest::new(0, 0, 640, 480).validate(frame).is_ok());
        assert!(RegionOfInterest::new(10, 10, 0, 5).validate(frame).is_err());
        assert!(RegionOfInterest::new(10, 10, 5, 0).validate(frame).is_err());
        assert!(RegionOfInterest::new(600, 0, 41, 10).validate(frame).is_err());
        assert!(
            RegionOfInterest::new(u32::MAX, 0, 2, 2)
                .validate(frame)
                .is_err()
        );
    }

    #[test]
    fn timestamps_survive_conversion() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_250);
        let back = from_unix_seconds(unix_seconds(t));
        let diff = back
            .duration_since(t)
            .unwrap_or_else(|e| e.duration());
        assert!(diff < Duration::from_micros(1));
    }
}
