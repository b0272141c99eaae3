use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use eyetrack_session::calibration_routine::{CalibrationRoutine, Phase, RoutineOutcome, Step};
use eyetrack_session::config::CalibrationRoutineConfig;
use eyetrack_session::presentation::{CanvasSurface, Displays, FrameClock};
use eyetrack_session::structs::{CalibrationDataset, GazePoint, PupilSample, RegionOfInterest};
use eyetrack_session::{CalibrationOutcome, EyeTracker, TrackerError, TrackerStatus};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::mpsc;

/// Tracker whose sample and status the test sets directly.
struct FakeTracker {
    sample: Mutex<Option<PupilSample>>,
    status: Mutex<TrackerStatus>,
    calibrated: Mutex<Option<CalibrationDataset>>,
}

impl FakeTracker {
    fn with_confidence(confidence: Option<f32>) -> Self {
        Self {
            sample: Mutex::new(confidence.map(|confidence| PupilSample {
                norm_pos: (0.5, 0.5),
                confidence,
                ..PupilSample::not_found(SystemTime::now())
            })),
            status: Mutex::new(TrackerStatus::Running),
            calibrated: Mutex::new(None),
        }
    }
}

#[async_trait]
impl EyeTracker for FakeTracker {
    async fn start(&self) -> Result<(), TrackerError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), TrackerError> {
        Ok(())
    }

    fn latest_sample(&self) -> Option<PupilSample> {
        *self.sample.lock().unwrap()
    }

    fn gaze(&self) -> Option<GazePoint> {
        None
    }

    fn status(&self) -> TrackerStatus {
        self.status.lock().unwrap().clone()
    }

    fn frame_size(&self) -> (u32, u32) {
        (640, 480)
    }

    fn region_of_interest(&self) -> RegionOfInterest {
        RegionOfInterest::full_frame((640, 480))
    }

    async fn set_region_of_interest(&self, _roi: RegionOfInterest) -> Result<(), TrackerError> {
        Ok(())
    }

    async fn calibrate(
        &self,
        dataset: CalibrationDataset,
    ) -> Result<CalibrationOutcome, TrackerError> {
        let samples = dataset.len();
        *self.calibrated.lock().unwrap() = Some(dataset);
        Ok(CalibrationOutcome::Submitted { samples })
    }
}

fn short_config() -> CalibrationRoutineConfig {
    CalibrationRoutineConfig {
        instruction_frames: 3,
        marker_duration_frames: 30,
        lead_in_frames: 5,
        lead_out_frames: 5,
        ..CalibrationRoutineConfig::default()
    }
}

#[test]
fn samples_only_between_lead_in_and_lead_out() {
    let config = short_config();
    let tracker = FakeTracker::with_confidence(Some(0.9));
    let mut routine = CalibrationRoutine::new(config.clone(), 0.4, &mut StdRng::seed_from_u64(1));
    let mut experiment = CanvasSurface::new(800, 600);
    let mut control = CanvasSurface::new(400, 300);
    let (keys, mut input) = mpsc::unbounded_channel();

    let mut kept_frames = Vec::new();
    let mut waited = 0;
    loop {
        let phase = routine.phase();
        if phase == Phase::WaitForStart {
            waited += 1;
            if waited == 5 {
                keys.send('x').unwrap();
                keys.send('c').unwrap();
            }
        }

        let before = routine.dataset().len();
        let mut displays = Displays {
            experiment: &mut experiment,
            control: &mut control,
        };
        let step = routine.step(&tracker, &mut displays, &mut input);
        if routine.dataset().len() > before {
            let Phase::Site { frame, .. } = phase else {
                panic!("sample kept outside a marker site: {phase:?}");
            };
            kept_frames.push(frame);
        }
        match step {
            Step::Continue => (),
            Step::Finished => break,
            Step::Aborted(reason) => panic!("aborted: {reason}"),
        }
    }

    let sites = config.marker_positions.len();
    assert_eq!(kept_frames.len(), sites * 19);
    assert!(kept_frames.iter().all(|f| *f > 5 && *f < 25));

    let mut visited: Vec<usize> = routine.dataset().pairs().iter().map(|p| p.reference.site).collect();
    visited.dedup();
    assert_eq!(visited, routine.order());
}

#[test]
fn low_confidence_samples_are_dropped() {
    let tracker = FakeTracker::with_confidence(Some(0.3));
    let mut routine = CalibrationRoutine::new(short_config(), 0.4, &mut StdRng::seed_from_u64(2));
    let mut experiment = CanvasSurface::new(800, 600);
    let mut control = CanvasSurface::new(400, 300);
    let (keys, mut input) = mpsc::unbounded_channel();
    keys.send('c').unwrap();

    let mut displays = Displays {
        experiment: &mut experiment,
        control: &mut control,
    };
    while routine.step(&tracker, &mut displays, &mut input) == Step::Continue {}
    assert!(routine.dataset().is_empty());
}

#[tokio::test]
async fn full_run_hands_dataset_to_tracker() {
    let tracker = FakeTracker::with_confidence(Some(1.0));
    let routine = CalibrationRoutine::new(short_config(), 0.4, &mut StdRng::seed_from_u64(3));
    let mut experiment = CanvasSurface::new(800, 600);
    let mut control = CanvasSurface::new(400, 300);
    let (keys, mut input) = mpsc::unbounded_channel();
    keys.send('c').unwrap();
    let mut clock = FrameClock::new(1000);

    let mut displays = Displays {
        experiment: &mut experiment,
        control: &mut control,
    };
    let outcome = routine
        .run(&tracker, &mut displays, &mut input, &mut clock)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RoutineOutcome::Calibrated(CalibrationOutcome::Submitted { samples: 190 })
    );
    assert_eq!(tracker.calibrated.lock().unwrap().as_ref().map(|d| d.len()), Some(190));
    assert!(experiment.frames_presented() > 300);
}

#[tokio::test]
async fn missing_pupil_data_aborts_without_calibrating() {
    for tracker in [
        FakeTracker::with_confidence(None),
        FakeTracker {
            status: Mutex::new(TrackerStatus::Failed("camera unplugged".to_string())),
            ..FakeTracker::with_confidence(Some(1.0))
        },
    ] {
        let routine = CalibrationRoutine::new(short_config(), 0.4, &mut StdRng::seed_from_u64(4));
        let mut experiment = CanvasSurface::new(800, 600);
        let mut control = CanvasSurface::new(400, 300);
        let (keys, mut input) = mpsc::unbounded_channel();
        keys.send('c').unwrap();
        let mut clock = FrameClock::new(1000);

        let mut displays = Displays {
            experiment: &mut experiment,
            control: &mut control,
        };
        let outcome = routine
            .run(&tracker, &mut displays, &mut input, &mut clock)
            .await
            .unwrap();
        assert!(matches!(outcome, RoutineOutcome::Aborted(_)));
        assert!(tracker.calibrated.lock().unwrap().is_none());
    }
}
