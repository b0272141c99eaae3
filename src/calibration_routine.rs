use std::time::SystemTime;

use rand::Rng;
use rand::seq::SliceRandom;

use crate::config::CalibrationRoutineConfig;
use crate::error::TrackerError;
use crate::presentation::{BLACK, Displays, FrameClock, OperatorInput, WHITE};
use crate::structs::{CalibrationDataset, ReferenceTarget};
use crate::tracker::{CalibrationOutcome, EyeTracker, TrackerStatus};

const INSTRUCTIONS: &str = "Follow the dot with your eyes until it disappears.";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Instructions { frame: u32 },
    WaitForStart,
    Site { index: usize, frame: u32 },
    Finalize,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Every site visited, the dataset is ready.
    Finished,
    Aborted(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum RoutineOutcome {
    Calibrated(CalibrationOutcome),
    Aborted(String),
}

fn linspace_at(from: f32, to: f32, count: u32, i: u32) -> f32 {
    if count <= 1 {
        return from;
    }
    from + (to - from) * i as f32 / (count - 1) as f32
}

/// Marker position in centred screen units, inset so a full-size marker
/// stays on screen.
pub fn reference_position(marker: (f32, f32), (width, height): (u32, u32), marker_size: f32) -> (f32, f32) {
    let inset = |m: f32, extent: u32| {
        let extent = extent as f32;
        (m - 0.5) * (extent - 2.0 * marker_size) / extent * 2.0
    };
    (inset(marker.0, width), inset(marker.1, height))
}

/// Marker sequence collecting pupil samples against known screen targets.
///
/// Driven one rendered frame at a time with [`CalibrationRoutine::step`].
pub struct CalibrationRoutine {
    config: CalibrationRoutineConfig,
    confidence_threshold: f32,
    order: Vec<usize>,
    phase: Phase,
    dataset: CalibrationDataset,
}

impl CalibrationRoutine {
    pub fn new<R: Rng + ?Sized>(
        config: CalibrationRoutineConfig,
        confidence_threshold: f32,
        rng: &mut R,
    ) -> Self {
        let mut order: Vec<usize> = (0..config.marker_positions.len()).collect();
        order.shuffle(rng);
        Self {
            config,
            confidence_threshold,
            order,
            phase: Phase::Instructions { frame: 0 },
            dataset: CalibrationDataset::new(),
        }
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn dataset(&self) -> &CalibrationDataset {
        &self.dataset
    }

    pub fn into_dataset(self) -> CalibrationDataset {
        self.dataset
    }

    /// Shrinks to nothing over the first half of a site, grows back over
    /// the second.
    pub fn marker_radius(&self, frame: u32) -> f32 {
        let duration = self.config.marker_duration_frames;
        let size = self.config.marker_size;
        let half = duration / 2;
        if frame < half {
            linspace_at(size, 0.0, half, frame)
        } else {
            linspace_at(0.0, size, duration - half, frame - half)
        }
    }

    pub fn is_eligible(&self, frame: u32) -> bool {
        frame > self.config.lead_in_frames
            && frame
                < self
                    .config
                    .marker_duration_frames
                    .saturating_sub(self.config.lead_out_frames)
    }

    pub fn step(
        &mut self,
        tracker: &dyn EyeTracker,
        displays: &mut Displays<'_>,
        input: &mut dyn OperatorInput,
    ) -> Step {
        match self.phase {
            Phase::Instructions { frame } => {
                displays.for_each(|surface| {
                    surface.clear(BLACK);
                    surface.draw_text(INSTRUCTIONS, (0.0, 0.0), WHITE);
                });
                self.phase = if frame + 1 >= self.config.instruction_frames {
                    Phase::WaitForStart
                } else {
                    Phase::Instructions { frame: frame + 1 }
                };
                Step::Continue
            }
            Phase::WaitForStart => {
                let prompt = format!("Press '{}' to start calibration", self.config.hotkey);
                displays.control.clear(BLACK);
                displays.control.draw_text(&prompt, (0.0, 0.0), WHITE);
                displays.experiment.clear(BLACK);

                while let Some(key) = input.poll_key() {
                    if key == self.config.hotkey {
                        log::info!("Calibration started, marker order {:?}", self.order);
                        self.phase = if self.order.is_empty() {
                            Phase::Finalize
                        } else {
                            Phase::Site { index: 0, frame: 0 }
                        };
                        break;
                    }
                }
                Step::Continue
            }
            Phase::Site { index, frame } => self.site_frame(tracker, displays, index, frame),
            Phase::Finalize => Step::Finished,
            Phase::Aborted => Step::Aborted("calibration already aborted".to_string()),
        }
    }

    fn site_frame(
        &mut self,
        tracker: &dyn EyeTracker,
        displays: &mut Displays<'_>,
        index: usize,
        frame: u32,
    ) -> Step {
        if let TrackerStatus::Failed(reason) = tracker.status() {
            self.phase = Phase::Aborted;
            return Step::Aborted(reason);
        }
        let Some(sample) = tracker.latest_sample() else {
            self.phase = Phase::Aborted;
            return Step::Aborted("eye tracker delivers no pupil data".to_string());
        };

        let site = self.order[index];
        let marker = self.config.marker_positions[site];
        let marker_size = self.config.marker_size;
        let radius = self.marker_radius(frame);
        let color = self.config.marker_color;
        displays.for_each(|surface| {
            let size = surface.size();
            let (x, y) = reference_position(marker, size, marker_size);
            surface.clear(BLACK);
            surface.draw_circle(
                (x / 2.0 * size.0 as f32, y / 2.0 * size.1 as f32),
                radius,
                color,
            );
        });

        if self.is_eligible(frame) && sample.confidence > self.confidence_threshold {
            self.dataset.push(
                sample,
                ReferenceTarget {
                    position: reference_position(marker, displays.experiment.size(), marker_size),
                    timestamp: SystemTime::now(),
                    site,
                },
            );
        }

        self.phase = if frame + 1 < self.config.marker_duration_frames {
            Phase::Site {
                index,
                frame: frame + 1,
            }
        } else if index + 1 < self.order.len() {
            log::debug!(
                "Site {site} done, {} samples so far",
                self.dataset.len()
            );
            Phase::Site {
                index: index + 1,
                frame: 0,
            }
        } else {
            Phase::Finalize
        };
        Step::Continue
    }

    /// Runs the whole routine at the clock's pace, then hands the dataset
    /// to the tracker.
    pub async fn run(
        mut self,
        tracker: &dyn EyeTracker,
        displays: &mut Displays<'_>,
        input: &mut dyn OperatorInput,
        clock: &mut FrameClock,
    ) -> Result<RoutineOutcome, TrackerError> {
        loop {
            clock.tick().await;
            let step = self.step(tracker, displays, input);
            displays.present();
            match step {
                Step::Continue => (),
                Step::Finished => break,
                Step::Aborted(reason) => {
                    log::error!("Calibration aborted: {reason}");
                    return Ok(RoutineOutcome::Aborted(reason));
                }
            }
        }

        let dataset = self.into_dataset();
        log::info!("Collected {} calibration samples", dataset.len());
        let outcome = tracker.calibrate(dataset).await?;
        Ok(RoutineOutcome::Calibrated(outcome))
    }
}
