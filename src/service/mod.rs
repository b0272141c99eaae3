//! Eye tracking delegated to an external tracking service.

pub mod channels;
pub mod process;
pub mod protocol;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TrackerConfig;
use crate::error::{CalibrationError, TrackerError};
use crate::recording::{rename_artifact, session_path, session_stem};
use crate::shared_state::SharedTrackerState;
use crate::structs::{CalibrationDataset, GazePoint, PupilSample, RegionOfInterest};
use crate::tracker::{CalibrationOutcome, EyeTracker, TrackerStatus};

use self::channels::{ControlChannel, DataChannel};
use self::process::ServiceProcess;
use self::protocol::{ControlRequest, DataMessage, PupilDatum, RefDatum};

pub const GAZE_STREAM_PART: &str = "gaze_stream.part";
pub const PUPIL_TIMESTAMPS_PART: &str = "pupil_timestamps.part";

const EYE_ID: u8 = 0;

/// Edge-triggered start of the service's recording.
///
/// Holds whether the one `start_recording` attempt succeeded. Callers
/// arriving while it is in flight wait for its reply.
struct Recording {
    started: OnceCell<bool>,
    session_name: String,
}

impl Recording {
    fn new(session_name: String) -> Self {
        Self {
            started: OnceCell::new(),
            session_name,
        }
    }

    fn is_started(&self) -> bool {
        self.started.get().copied().unwrap_or(false)
    }

    /// Sends `start_recording` the first time only. Only the caller that
    /// made the attempt sees its error.
    async fn ensure_started(&self, control: &ControlChannel) -> Result<(), TrackerError> {
        let mut failure = None;
        let slot = &mut failure;
        let session_name = &self.session_name;
        self.started
            .get_or_init(|| async move {
                let request = ControlRequest::StartRecording {
                    session_name: session_name.clone(),
                };
                match control.command(&request).await {
                    Ok(()) => {
                        log::info!("Service recording {session_name} started");
                        true
                    }
                    Err(err) => {
                        *slot = Some(err);
                        false
                    }
                }
            })
            .await;
        failure.map_or(Ok(()), Err)
    }
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<Result<(), TrackerError>>,
}

pub struct ServiceTracker {
    config: TrackerConfig,
    stem: String,
    control: Arc<ControlChannel>,
    recording: Arc<Recording>,
    shared: Arc<SharedTrackerState>,
    status: Arc<ArcSwap<TrackerStatus>>,
    roi: ArcSwap<RegionOfInterest>,
    process: Mutex<Option<ServiceProcess>>,
    worker: Mutex<Option<Worker>>,
    shut_down: AtomicBool,
}

impl ServiceTracker {
    /// Starts the service (unless attaching to a running one), connects the
    /// control channel and asks for the eye process.
    pub async fn launch(config: TrackerConfig) -> Result<Self, TrackerError> {
        config.validate()?;
        let service = &config.service;

        let process = match &service.program {
            Some(program) => Some(ServiceProcess::spawn(program, &service.args)?),
            None => {
                log::info!("Attaching to a running service at {}", service.control_address);
                None
            }
        };

        let control = ControlChannel::connect(
            &service.control_address,
            service.connect_timeout(),
            service.reply_timeout(),
        )
        .await?;
        control
            .command(&ControlRequest::StartEyeProcess { eye_id: EYE_ID })
            .await?;
        tokio::time::sleep(service.settle()).await;

        let stem = session_stem(SystemTime::now());
        Ok(Self {
            recording: Arc::new(Recording::new(stem.clone())),
            stem,
            control: Arc::new(control),
            shared: Arc::new(SharedTrackerState::new()),
            status: Arc::new(ArcSwap::from_pointee(TrackerStatus::Idle)),
            roi: ArcSwap::from_pointee(config.region_of_interest()),
            process: Mutex::new(process),
            worker: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            config,
        })
    }

    pub fn session_stem(&self) -> &str {
        &self.stem
    }

    fn artifacts(&self) -> Vec<(PathBuf, PathBuf)> {
        let output_dir = &self.config.output_dir;
        let service = &self.config.service;
        let renamed = |name: &str| session_path(output_dir, &self.stem, &format!("_{name}"));
        vec![
            (
                output_dir.join(GAZE_STREAM_PART),
                renamed("gaze.jsonl"),
            ),
            (
                output_dir.join(PUPIL_TIMESTAMPS_PART),
                renamed("pupil_timestamps.txt"),
            ),
            (
                service.recording_dir.join(&service.eye_video_name),
                renamed(&service.eye_video_name),
            ),
            (
                service.recording_dir.join(&service.eye_timestamps_name),
                renamed(&service.eye_timestamps_name),
            ),
        ]
    }

    fn rename_artifacts(&self) {
        for (from, to) in self.artifacts() {
            if let Err(err) = rename_artifact(&from, &to) {
                log::warn!("Failed to move {} to {}: {err}", from.display(), to.display());
            }
        }
    }
}

impl Drop for ServiceTracker {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut() {
            worker.token.cancel();
        }
    }
}

#[async_trait]
impl EyeTracker for ServiceTracker {
    async fn start(&self) -> Result<(), TrackerError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TrackerError::Process(
                "tracking service was already shut down".to_string(),
            ));
        }
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            log::warn!("Service tracker already running");
            return Ok(());
        }

        let service = &self.config.service;
        let data = DataChannel::subscribe(
            &service.data_address,
            service.connect_timeout(),
            &["pupil", "gaze"],
        )
        .await?;
        let streams = StreamFiles::create(&self.config.output_dir).await?;

        let receiver = Receiver {
            data,
            streams,
            control: self.control.clone(),
            recording: self.recording.clone(),
            shared: self.shared.clone(),
            receive_timeout: service.receive_timeout(),
            drain_timeout: service.drain_timeout(),
            drain_limit: service.drain_limit(),
        };

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let status = self.status.clone();
        status.store(Arc::new(TrackerStatus::Running));
        let handle = tokio::spawn(async move {
            let result = receiver.run(&loop_token).await;
            match &result {
                Ok(()) => status.store(Arc::new(TrackerStatus::Stopped)),
                Err(err) => {
                    log::error!("Service receive loop stopped: {err}");
                    status.store(Arc::new(TrackerStatus::Failed(err.to_string())));
                }
            }
            result
        });

        *worker = Some(Worker { token, handle });
        log::info!("Receiving from tracking service at {}", service.data_address);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TrackerError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.token.cancel();
            match worker.handle.await {
                Ok(Ok(())) => (),
                Ok(Err(err)) => log::warn!("Service receive loop had failed: {err}"),
                Err(err) => log::error!("Service receive task panicked: {err}"),
            }
        }

        if self.recording.is_started() {
            if let Err(err) = self.control.command(&ControlRequest::StopRecording).await {
                log::warn!("Failed to stop the service recording: {err}");
            }
        }
        if let Err(err) = self.control.command(&ControlRequest::Shutdown).await {
            log::warn!("Service did not acknowledge shutdown: {err}");
        }

        let mut result = Ok(());
        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            if let Err(err) = process
                .wait_with_timeout(self.config.service.exit_timeout())
                .await
            {
                result = Err(err);
            }
        }

        self.rename_artifacts();
        if !matches!(**self.status.load(), TrackerStatus::Failed(_)) {
            self.status.store(Arc::new(TrackerStatus::Stopped));
        }
        result
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
        roi.validate(self.config.resolution)?;
        self.control.command(&ControlRequest::SetRoi { roi }).await?;
        self.roi.store(Arc::new(roi));
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

        self.recording.ensure_started(&self.control).await?;
        self.control
            .command(&ControlRequest::StartPlugin {
                name: self.config.service.calibration_plugin.clone(),
                frame_size: self.config.resolution,
            })
            .await?;

        let pupil_list = dataset.pairs().iter().map(|p| PupilDatum::from(&p.pupil)).collect();
        let ref_list = dataset.pairs().iter().map(|p| RefDatum::from(&p.reference)).collect();
        let reply = self
            .control
            .request(&ControlRequest::SubmitCalibration {
                pupil_list,
                ref_list,
            })
            .await?;
        if !reply.ok {
            log::warn!("Service rejected calibration: {}", reply.message);
            return Err(CalibrationError::Rejected(reply.message).into());
        }

        log::info!("Submitted {} calibration pairs", dataset.len());
        Ok(CalibrationOutcome::Submitted {
            samples: dataset.len(),
        })
    }
}

/// Files the receive loop streams into while the service records.
struct StreamFiles {
    gaze: BufWriter<File>,
    pupil_timestamps: BufWriter<File>,
}

impl StreamFiles {
    async fn create(output_dir: &Path) -> Result<Self, TrackerError> {
        tokio::fs::create_dir_all(output_dir).await?;
        Ok(Self {
            gaze: BufWriter::new(File::create(output_dir.join(GAZE_STREAM_PART)).await?),
            pupil_timestamps: BufWriter::new(
                File::create(output_dir.join(PUPIL_TIMESTAMPS_PART)).await?,
            ),
        })
    }

    async fn flush(&mut self) -> Result<(), TrackerError> {
        self.gaze.flush().await?;
        self.pupil_timestamps.flush().await?;
        Ok(())
    }
}

struct Receiver {
    data: DataChannel,
    streams: StreamFiles,
    control: Arc<ControlChannel>,
    recording: Arc<Recording>,
    shared: Arc<SharedTrackerState>,
    receive_timeout: Duration,
    drain_timeout: Duration,
    drain_limit: Duration,
}

impl Receiver {
    async fn run(mut self, token: &CancellationToken) -> Result<(), TrackerError> {
        let result = self.receive(token).await;
        let flushed = self.streams.flush().await;
        result?;
        flushed
    }

    async fn receive(&mut self, token: &CancellationToken) -> Result<(), TrackerError> {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                line = self.data.next_line(self.receive_timeout) => {
                    if let Some(line) = line? {
                        self.handle_line(&line).await?;
                    }
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.drain_limit;
        let mut drained = 0usize;
        while tokio::time::Instant::now() < deadline {
            match self.data.next_line(self.drain_timeout).await {
                Ok(Some(line)) => {
                    self.handle_line(&line).await?;
                    drained += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    log::debug!("Data channel ended while draining: {err}");
                    break;
                }
            }
        }
        log::debug!("Drained {drained} buffered service messages");
        Ok(())
    }

    async fn handle_line(&mut self, line: &str) -> Result<(), TrackerError> {
        let message: DataMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                log::debug!("Ignoring malformed service message: {err}");
                return Ok(());
            }
        };

        if let Err(err) = self.recording.ensure_started(&self.control).await {
            log::warn!("Failed to start the service recording: {err}");
        }

        match message {
            DataMessage::Pupil(datum) => {
                self.shared.update_sample(datum.to_sample());
                self.streams
                    .pupil_timestamps
                    .write_all(format!("{:.6}\n", datum.timestamp).as_bytes())
                    .await?;
            }
            DataMessage::Gaze(datum) => {
                self.shared.update_gaze(datum.to_centred());
                self.streams.gaze.write_all(line.as_bytes()).await?;
                self.streams.gaze.write_all(b"\n").await?;
            }
            DataMessage::Other => (),
        }
        Ok(())
    }
}
