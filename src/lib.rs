pub mod calibration;
pub mod calibration_routine;
pub mod camera;
pub mod camera_manager;
pub mod camera_sources;
pub mod config;
pub mod desktop;
pub mod detector;
pub mod engine;
pub mod error;
pub mod gaze_overlay;
pub mod logging;
pub mod presentation;
pub mod recording;
pub mod service;
pub mod shared_state;
pub mod structs;
pub mod tracker;

pub use engine::InProcessTracker;
pub use error::{CalibrationError, TrackerError};
pub use service::ServiceTracker;
pub use tracker::{CalibrationOutcome, EyeTracker, TrackerStatus};
