use std::sync::Arc;

use async_trait::async_trait;

use crate::calibration::GazeMapping;
use crate::error::TrackerError;
use crate::structs::{CalibrationDataset, GazePoint, PupilSample, RegionOfInterest};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackerStatus {
    Idle,
    Running,
    Stopped,
    /// Loop halted on a device or service failure.
    Failed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum CalibrationOutcome {
    /// Dataset below the minimum size, nothing changed.
    Skipped { samples: usize, needed: usize },
    /// New mapping in use.
    Installed(Arc<GazeMapping>),
    /// Handed to the tracking service's own solver.
    Submitted { samples: usize },
}

/// What the presentation loop sees of an eye tracker, whichever backend
/// does the tracking.
///
/// `latest_sample`, `gaze` and `status` return immediately and are meant to be
/// polled once per rendered frame.
#[async_trait]
pub trait EyeTracker: Send + Sync {
    async fn start(&self) -> Result<(), TrackerError>;

    /// Idempotent, and safe before `start`.
    async fn stop(&self) -> Result<(), TrackerError>;

    fn latest_sample(&self) -> Option<PupilSample>;

    fn gaze(&self) -> Option<GazePoint>;

    fn status(&self) -> TrackerStatus;

    fn frame_size(&self) -> (u32, u32);

    /// Region the pupil is searched in, in camera pixels.
    fn region_of_interest(&self) -> RegionOfInterest;

    async fn set_region_of_interest(&self, roi: RegionOfInterest) -> Result<(), TrackerError>;

    async fn calibrate(
        &self,
        dataset: CalibrationDataset,
    ) -> Result<CalibrationOutcome, TrackerError>;
}
