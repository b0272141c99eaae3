use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    /// Camera could not be opened or stopped delivering frames.
    #[error("device error: {0}")]
    Device(String),
    /// Rejected parameter, the previous valid state is kept.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    /// External tracking service failed to start, answer or exit.
    #[error("tracking service error: {0}")]
    Process(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("not enough calibration points (got {got}, need >= {needed})")]
    InsufficientData { got: usize, needed: usize },
    #[error("calibration points are degenerate (rank {rank} < {needed})")]
    IllConditioned { rank: usize, needed: usize },
    #[error("polynomial fit did not converge (inliers={inliers}, need >= {needed})")]
    NotConverged { inliers: usize, needed: usize },
    #[error("calibration rejected by the tracking service: {0}")]
    Rejected(String),
}

/// Failure to analyse a single frame. Never leaves the acquisition loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectError {
    #[error("region of interest {roi:?} lies outside the {width}x{height} frame")]
    RoiOutsideFrame {
        roi: (u32, u32, u32, u32),
        width: u32,
        height: u32,
    },
    #[error("degenerate pupil blob")]
    Degenerate,
}
