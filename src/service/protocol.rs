//! Newline-delimited JSON spoken with the tracking service.

use serde::{Deserialize, Serialize};

use crate::structs::{
    Ellipse, GazePoint, PupilSample, ReferenceTarget, RegionOfInterest, from_unix_seconds,
    unix_seconds,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subject", rename_all = "snake_case")]
pub enum ControlRequest {
    StartEyeProcess { eye_id: u8 },
    StopEyeProcess { eye_id: u8 },
    StartRecording { session_name: String },
    StopRecording,
    StartPlugin { name: String, frame_size: (u32, u32) },
    SubmitCalibration {
        pupil_list: Vec<PupilDatum>,
        ref_list: Vec<RefDatum>,
    },
    SetRoi { roi: RegionOfInterest },
    Shutdown,
}

impl ControlRequest {
    pub fn subject(&self) -> &'static str {
        match self {
            ControlRequest::StartEyeProcess { .. } => "start_eye_process",
            ControlRequest::StopEyeProcess { .. } => "stop_eye_process",
            ControlRequest::StartRecording { .. } => "start_recording",
            ControlRequest::StopRecording => "stop_recording",
            ControlRequest::StartPlugin { .. } => "start_plugin",
            ControlRequest::SubmitCalibration { .. } => "submit_calibration",
            ControlRequest::SetRoi { .. } => "set_roi",
            ControlRequest::Shutdown => "shutdown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
}

/// One line on the data channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum DataMessage {
    Pupil(PupilDatum),
    Gaze(GazeDatum),
    #[serde(other)]
    Other,
}

/// Pupil position as the service reports it, `norm_pos` image-normalised
/// with a bottom-left origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PupilDatum {
    pub norm_pos: (f32, f32),
    #[serde(default)]
    pub diameter: f32,
    pub confidence: f32,
    /// Unix seconds.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ellipse: Option<Ellipse>,
}

impl PupilDatum {
    pub fn to_sample(&self) -> PupilSample {
        PupilSample {
            norm_pos: self.norm_pos,
            ellipse: self.ellipse.unwrap_or_default(),
            diameter: self.diameter,
            confidence: self.confidence,
            timestamp: from_unix_seconds(self.timestamp),
        }
    }
}

impl From<&PupilSample> for PupilDatum {
    fn from(sample: &PupilSample) -> Self {
        Self {
            norm_pos: sample.norm_pos,
            diameter: sample.diameter,
            confidence: sample.confidence,
            timestamp: unix_seconds(sample.timestamp),
            ellipse: Some(sample.ellipse),
        }
    }
}

/// Gaze as the service reports it, `[0, 1]` over the screen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GazeDatum {
    pub norm_pos: (f32, f32),
    #[serde(default)]
    pub confidence: f32,
    pub timestamp: f64,
}

impl GazeDatum {
    pub fn to_centred(&self) -> GazePoint {
        GazePoint::new(self.norm_pos.0 * 2.0 - 1.0, self.norm_pos.1 * 2.0 - 1.0)
    }
}

/// Calibration target in the service's `[0, 1]` screen units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefDatum {
    pub norm_pos: (f32, f32),
    pub timestamp: f64,
    pub site: usize,
}

impl From<&ReferenceTarget> for RefDatum {
    fn from(target: &ReferenceTarget) -> Self {
        Self {
            norm_pos: (
                (target.position.0 + 1.0) / 2.0,
                (target.position.1 + 1.0) / 2.0,
            ),
            timestamp: unix_seconds(target.timestamp),
            site: target.site,
        }
    }
}
