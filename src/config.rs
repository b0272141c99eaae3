use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TrackerError;
use crate::structs::RegionOfInterest;

/// Marker grid used by the calibration routine, `[0, 1]` screen units.
pub const MARKER_POSITIONS: [(f32, f32); 10] = [
    (0.25, 0.5),
    (0.0, 0.5),
    (0.0, 1.0),
    (0.5, 1.0),
    (1.0, 1.0),
    (1.0, 0.5),
    (1.0, 0.0),
    (0.5, 0.0),
    (0.0, 0.0),
    (0.75, 0.5),
];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorKind {
    /// Per-frame dark-blob ellipse fit.
    #[serde(rename = "2d")]
    Ellipse2d,
    /// Ellipse fit smoothed over time.
    #[serde(rename = "3d")]
    Temporal3d,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// Pupil diameter bounds in pixels.
    pub pupil_size_min: f32,
    pub pupil_size_max: f32,
    /// Gray levels above the darkest pixel still counted as pupil.
    pub intensity_range: u8,
    /// One-euro parameters of the temporal detector.
    pub smoothing_min_cutoff: f32,
    pub smoothing_beta: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            pupil_size_min: 50.0,
            pupil_size_max: 200.0,
            intensity_range: 10,
            smoothing_min_cutoff: 1.0,
            smoothing_beta: 0.3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationRoutineConfig {
    pub frame_rate: u32,
    pub instruction_frames: u32,
    pub hotkey: char,
    pub marker_size: f32,
    pub marker_color: [u8; 3],
    pub marker_duration_frames: u32,
    pub lead_in_frames: u32,
    pub lead_out_frames: u32,
    pub marker_positions: Vec<(f32, f32)>,
}

impl Default for CalibrationRoutineConfig {
    fn default() -> Self {
        Self {
            frame_rate: 60,
            instruction_frames: 60 * 5,
            hotkey: 'c',
            marker_size: 50.0,
            marker_color: [204, 0, 128],
            marker_duration_frames: 240,
            lead_in_frames: 20,
            lead_out_frames: 20,
            marker_positions: MARKER_POSITIONS.to_vec(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service executable, `None` attaches to an already running service.
    pub program: Option<String>,
    pub args: Vec<String>,
    pub control_address: String,
    pub data_address: String,
    pub connect_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub settle_ms: u64,
    pub receive_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    /// Upper bound on draining, the stream may never pause.
    pub drain_limit_ms: u64,
    pub exit_timeout_ms: u64,
    /// Directory the service writes its own recordings to.
    pub recording_dir: PathBuf,
    pub eye_video_name: String,
    pub eye_timestamps_name: String,
    pub calibration_plugin: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            program: Some("pupil_capture".to_string()),
            args: Vec::new(),
            control_address: "127.0.0.1:50020".to_string(),
            data_address: "127.0.0.1:50021".to_string(),
            connect_timeout_ms: 10_000,
            reply_timeout_ms: 5_000,
            settle_ms: 2_000,
            receive_timeout_ms: 100,
            drain_timeout_ms: 50,
            drain_limit_ms: 1_000,
            exit_timeout_ms: 5_000,
            recording_dir: PathBuf::from("output/eyetracking/service"),
            eye_video_name: "eye0.mp4".to_string(),
            eye_timestamps_name: "eye0_timestamps.npy".to_string(),
            calibration_plugin: "HMD_Calibration".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn drain_limit(&self) -> Duration {
        Duration::from_millis(self.drain_limit_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }
}

/// Every tunable of a tracking session. Passed to components at
/// construction and never mutated behind their back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// `uvc://N`, `/dev/videoN` or an MJPEG `http://` stream.
    pub camera: String,
    pub resolution: (u32, u32),
    pub camera_fps: u32,
    pub detector: DetectorKind,
    pub detector_settings: DetectorSettings,
    pub region_of_interest: Option<RegionOfInterest>,
    pub confidence_threshold: f32,
    pub min_calibration_samples: usize,
    pub outlier_threshold_px: f32,
    pub output_dir: PathBuf,
    pub calibration: CalibrationRoutineConfig,
    pub service: ServiceConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            camera: "uvc://0".to_string(),
            resolution: (640, 480),
            camera_fps: 30,
            detector: DetectorKind::Ellipse2d,
            detector_settings: DetectorSettings::default(),
            region_of_interest: None,
            confidence_threshold: 0.4,
            min_calibration_samples: 100,
            outlier_threshold_px: 35.0,
            output_dir: PathBuf::from("output/eyetracking"),
            calibration: CalibrationRoutineConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

impl TrackerConfig {
    pub fn from_file(path: &Path) -> Result<Self, TrackerError> {
        let text = std::fs::read_to_string(path)?;
        let config: TrackerConfig = serde_json::from_str(&text)
            .map_err(|e| TrackerError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn region_of_interest(&self) -> RegionOfInterest {
        self.region_of_interest
            .unwrap_or_else(|| RegionOfInterest::full_frame(self.resolution))
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        let fail = |msg: String| Err(TrackerError::Config(msg));

        if self.resolution.0 == 0 || self.resolution.1 == 0 {
            return fail(format!("resolution {:?} has zero area", self.resolution));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return fail(format!(
                "confidence threshold {} outside [0, 1]",
                self.confidence_threshold
            ));
        }
        if self.min_calibration_samples < crate::calibration::POLYNOMIAL_TERMS {
            return fail(format!(
                "min_calibration_samples {} is below the {} polynomial terms",
                self.min_calibration_samples,
                crate::calibration::POLYNOMIAL_TERMS
            ));
        }
        if self.outlier_threshold_px <= 0.0 {
            return fail(format!(
                "outlier threshold {} must be positive",
                self.outlier_threshold_px
            ));
        }
        let settings = &self.detector_settings;
        if settings.pupil_size_min <= 0.0 || settings.pupil_size_min > settings.pupil_size_max {
            return fail(format!(
                "pupil size range {}..{} is invalid",
                settings.pupil_size_min, settings.pupil_size_max
            ));
        }

        let cal = &self.calibration;
        if cal.frame_rate == 0 {
            return fail("calibration frame rate must be positive".to_string());
        }
        if cal.marker_duration_frames < 2
            || cal.lead_in_frames + cal.lead_out_frames >= cal.marker_duration_frames
        {
            return fail(format!(
                "lead-in {} + lead-out {} leave no samples in {} marker frames",
                cal.lead_in_frames, cal.lead_out_frames, cal.marker_duration_frames
            ));
        }
        if cal.marker_positions.is_empty() {
            return fail("no calibration marker positions".to_string());
        }

        if let Some(roi) = &self.region_of_interest {
            roi.validate(self.resolution)?;
        }
        Ok(())
    }
}
