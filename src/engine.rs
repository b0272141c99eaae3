use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::calibration::{CalibrationSolver, GazeMapping};
use crate::camera::{Frame, FrameSource, SourceOpener};
use crate::camera_manager::camera_source_from_uri;
use crate::camera_sources::FpsCounter;
use crate::config::TrackerConfig;
use crate::detector::{PupilDetector, create_detector};
use crate::error::TrackerError;
use crate::recording::{
    CALIBRATION_DATA_FILE, SessionRecorder, session_stem, write_calibration_points,
};
use crate::shared_state::SharedTrackerState;
use crate::structs::{CalibrationDataset, GazePoint, PupilSample, RegionOfInterest};
use crate::tracker::{CalibrationOutcome, EyeTracker, TrackerStatus};

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<Result<(), TrackerError>>,
}

/// Camera capture and pupil detection on a dedicated blocking thread.
pub struct InProcessTracker {
    config: TrackerConfig,
    open_source: SourceOpener,
    shared: Arc<SharedTrackerState>,
    roi: Arc<ArcSwap<RegionOfInterest>>,
    mapping: Arc<ArcSwapOption<GazeMapping>>,
    status: Arc<ArcSwap<TrackerStatus>>,
    worker: Mutex<Option<Worker>>,
}

impl InProcessTracker {
    pub fn new(config: TrackerConfig, open_source: SourceOpener) -> Result<Self, TrackerError> {
        config.validate()?;
        let roi = config.region_of_interest();
        Ok(Self {
            config,
            open_source,
            shared: Arc::new(SharedTrackerState::new()),
            roi: Arc::new(ArcSwap::from_pointee(roi)),
            mapping: Arc::new(ArcSwapOption::empty()),
            status: Arc::new(ArcSwap::from_pointee(TrackerStatus::Idle)),
            worker: Mutex::new(None),
        })
    }

    pub fn from_config(config: TrackerConfig) -> Result<Self, TrackerError> {
        let opener = camera_source_from_uri(&config.camera, config.resolution, config.camera_fps)?;
        Self::new(config, opener)
    }

    pub fn mapping(&self) -> Option<Arc<GazeMapping>> {
        self.mapping.load_full()
    }
}

impl Drop for InProcessTracker {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut() {
            worker.token.cancel();
        }
    }
}

#[async_trait]
impl EyeTracker for InProcessTracker {
    async fn start(&self) -> Result<(), TrackerError> {
        let mut worker = self.worker.lock().await;
        if let Some(running) = worker.as_ref() {
            if !running.handle.is_finished() {
                log::warn!("Eye tracker already running");
                return Ok(());
            }
        }
        if let Some(finished) = worker.take() {
            let _ = finished.handle.await;
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let token = CancellationToken::new();

        let config = self.config.clone();
        let open_source = self.open_source.clone();
        let shared = self.shared.clone();
        let roi = self.roi.clone();
        let mapping = self.mapping.clone();
        let status = self.status.clone();
        let loop_token = token.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let acquisition = match Acquisition::open(&config, &open_source) {
                Ok(source_and_sink) => source_and_sink,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return Ok(());
                }
            };
            status.store(Arc::new(TrackerStatus::Running));
            let _ = ready_tx.send(Ok(()));

            let result = acquisition.run(&shared, &roi, &mapping, &loop_token);
            match &result {
                Ok(()) => status.store(Arc::new(TrackerStatus::Stopped)),
                Err(err) => {
                    log::error!("Eye tracker stopped: {err}");
                    status.store(Arc::new(TrackerStatus::Failed(err.to_string())));
                }
            }
            result
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                log::info!("Eye tracker started on {}", self.config.camera);
                *worker = Some(Worker { token, handle });
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = handle.await;
                log::error!("Failed to start eye tracker: {err}");
                Err(err)
            }
            Err(_) => {
                let _ = handle.await;
                Err(TrackerError::Device(
                    "acquisition thread exited during start".to_string(),
                ))
            }
        }
    }

    async fn stop(&self) -> Result<(), TrackerError> {
        let Some(worker) = self.worker.lock().await.take() else {
            return Ok(());
        };

        worker.token.cancel();
        match worker.handle.await {
            Ok(Ok(())) => log::info!("Eye tracker stopped"),
            Ok(Err(err)) => log::warn!("Eye tracker had already failed: {err}"),
            Err(err) => log::error!("Acquisition thread panicked: {err}"),
        }
        Ok(())
    }

    fn latest_sample(&self) -> Option<PupilSample> {
        self.shared.snapshot().sample
    }

    fn gaze(&self) -> Option<GazePoint> {
        self.shared.snapshot().gaze
    }

    fn status(&self) -> TrackerStatus {
        self.status.load().as_ref().clone()
    }

    fn frame_size(&self) -> (u32, u32) {
        self.config.resolution
    }

    fn region_of_interest(&self) -> RegionOfInterest {
        **self.roi.load()
    }

    async fn set_region_of_interest(&self, roi: RegionOfInterest) -> Result<(), TrackerError> {
        if let Err(err) = roi.validate(self.config.resolution) {
            log::warn!("Keeping region {:?}: {err}", self.region_of_interest());
            return Err(err);
        }
        self.roi.store(Arc::new(roi));
        log::info!("Region of interest set to {roi:?}");
        Ok(())
    }

    async fn calibrate(
        &self,
        dataset: CalibrationDataset,
    ) -> Result<CalibrationOutcome, TrackerError> {
        let needed = self.config.min_calibration_samples;
        if dataset.len() < needed {
            log::warn!(
                "Skipping calibration, {} samples collected out of {needed}",
                dataset.len()
            );
            return Ok(CalibrationOutcome::Skipped {
                samples: dataset.len(),
                needed,
            });
        }

        let solver = CalibrationSolver::new(self.config.resolution, self.config.outlier_threshold_px);
        let mapping = match solver.fit(&dataset) {
            Ok(mapping) => Arc::new(mapping),
            Err(err) => {
                log::warn!("Calibration failed, keeping the previous mapping: {err}");
                return Err(err.into());
            }
        };
        self.mapping.store(Some(mapping.clone()));

        let path = self.config.output_dir.join(CALIBRATION_DATA_FILE);
        if let Err(err) = std::fs::create_dir_all(&self.config.output_dir)
            .and_then(|()| write_calibration_points(&path, &dataset))
        {
            log::warn!("Failed to write {}: {err}", path.display());
        }

        Ok(CalibrationOutcome::Installed(mapping))
    }
}

/// Everything owned by the acquisition thread.
struct Acquisition {
    source: Box<dyn FrameSource>,
    detector: Box<dyn PupilDetector>,
    recorder: SessionRecorder,
}

impl Acquisition {
    fn open(config: &TrackerConfig, open_source: &SourceOpener) -> Result<Self, TrackerError> {
        let source = open_source()?;
        if source.resolution() != config.resolution {
            return Err(TrackerError::Device(format!(
                "{} delivers {:?}, configured for {:?}",
                config.camera,
                source.resolution(),
                config.resolution
            )));
        }
        let detector = create_detector(config.detector, &config.detector_settings);
        let recorder = SessionRecorder::create(&config.output_dir, &session_stem(SystemTime::now()))?;

        Ok(Self {
            source,
            detector,
            recorder,
        })
    }

    fn run(
        mut self,
        shared: &SharedTrackerState,
        roi: &ArcSwap<RegionOfInterest>,
        mapping: &ArcSwapOption<GazeMapping>,
        token: &CancellationToken,
    ) -> Result<(), TrackerError> {
        let result = self.acquire(shared, roi, mapping, token);
        let closed = self.recorder.finish();
        result?;
        closed?;
        Ok(())
    }

    fn acquire(
        &mut self,
        shared: &SharedTrackerState,
        roi: &ArcSwap<RegionOfInterest>,
        mapping: &ArcSwapOption<GazeMapping>,
        token: &CancellationToken,
    ) -> Result<(), TrackerError> {
        let mut fps = FpsCounter::new();

        while !token.is_cancelled() {
            let frame = self.source.next_frame()?;

            let sample = match &frame {
                Some(frame) => self.detect(frame, &roi.load()),
                None => {
                    log::warn!("Dropped a camera frame");
                    PupilSample::not_found(SystemTime::now())
                }
            };

            let mapping = mapping.load_full();
            let gaze = match &mapping {
                Some(mapping) if sample.is_found() => Some(mapping.map(sample.norm_pos)),
                _ => None,
            };

            shared.publish(sample, gaze);
            self.recorder
                .log_sample(&sample, mapping.as_ref().map(|_| gaze))?;
            if let Some(frame) = &frame {
                self.recorder.write_frame(frame)?;
            }

            fps.update_fps();
        }
        Ok(())
    }

    fn detect(&mut self, frame: &Frame, roi: &RegionOfInterest) -> PupilSample {
        match self.detector.detect(frame, roi) {
            Ok(Some(sample)) => sample,
            Ok(None) => PupilSample::not_found(frame.timestamp),
            Err(err) => {
                log::debug!("Detection failed on frame {}: {err}", frame.index);
                PupilSample::not_found(frame.timestamp)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    struct BlankSource {
        resolution: (u32, u32),
        index: u64,
    }

    impl FrameSource for BlankSource {
        fn resolution(&self) -> (u32, u32) {
            self.resolution
        }

        fn next_frame(&mut self) -> Result<Option<Frame>, TrackerError> {
            std::thread::sleep(std::time::Duration::from_millis(2));
            self.index += 1;
            let pixels = GrayImage::from_pixel(self.resolution.0, self.resolution.1, Luma([128]));
            Ok(Some(Frame::new(pixels, SystemTime::now(), self.index)))
        }
    }

    fn tracker(dir: &std::path::Path, delivered: (u32, u32)) -> InProcessTracker {
        let config = TrackerConfig {
            resolution: (64, 48),
            output_dir: dir.to_path_buf(),
            ..TrackerConfig::default()
        };
        InProcessTracker::new(
            config,
            Arc::new(move || {
                Ok(Box::new(BlankSource {
                    resolution: delivered,
                    index: 0,
                }) as Box<dyn FrameSource>)
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn stop_before_start_and_twice() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), (64, 48));
        tracker.stop().await.unwrap();
        assert_eq!(tracker.status(), TrackerStatus::Idle);

        tracker.start().await.unwrap();
        assert_eq!(tracker.status(), TrackerStatus::Running);
        tracker.stop().await.unwrap();
        tracker.stop().await.unwrap();
        assert_eq!(tracker.status(), TrackerStatus::Stopped);
    }

    #[tokio::test]
    async fn wrong_resolution_is_a_device_error() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), (320, 240));
        assert!(matches!(tracker.start().await, Err(TrackerError::Device(_))));
        assert_eq!(tracker.latest_sample(), None);
        tracker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_regions_keep_the_previous_one() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), (64, 48));
        let good = RegionOfInterest::new(4, 4, 32, 32);
        tracker.set_region_of_interest(good).await.unwrap();

        for bad in [
            RegionOfInterest::new(0, 0, 0, 10),
            RegionOfInterest::new(0, 0, 10, 0),
            RegionOfInterest::new(40, 0, 30, 10),
        ] {
            assert!(matches!(
                tracker.set_region_of_interest(bad).await,
                Err(TrackerError::Config(_))
            ));
            assert_eq!(tracker.region_of_interest(), good);
        }
    }

    #[tokio::test]
    async fn small_dataset_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker(dir.path(), (64, 48));
        let mut dataset = CalibrationDataset::new();
        for i in 0..99 {
            dataset.push(
                PupilSample {
                    norm_pos: (i as f32 / 99.0, 0.5),
                    confidence: 1.0,
                    ..PupilSample::not_found(SystemTime::now())
                },
                crate::structs::ReferenceTarget {
                    position: (0.0, 0.0),
                    timestamp: SystemTime::now(),
                    site: 0,
                },
            );
        }
        let outcome = tracker.calibrate(dataset).await.unwrap();
        assert_eq!(
            outcome,
            CalibrationOutcome::Skipped {
                samples: 99,
                needed: 100
            }
        );
        assert!(tracker.mapping().is_none());
        assert!(!dir.path().join(CALIBRATION_DATA_FILE).exists());
    }
}
