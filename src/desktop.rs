use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::calibration_routine::{CalibrationRoutine, RoutineOutcome};
use crate::config::TrackerConfig;
use crate::engine::InProcessTracker;
use crate::error::TrackerError;
use crate::gaze_overlay::{GazeOverlay, PupilOverlay};
use crate::logging::setup_logging;
use crate::presentation::{
    BLACK, CanvasSurface, Displays, FrameClock, GREY, OperatorInput, PresentationSurface,
    StdinKeys, WHITE,
};
use crate::service::ServiceTracker;
use crate::tracker::{CalibrationOutcome, EyeTracker, TrackerStatus};

const QUIT_KEY: char = 'q';

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short = 'c')]
    config: Option<PathBuf>,

    /// Eye camera URI, overrides the configuration
    #[arg(short = 'e')]
    camera: Option<String>,

    /// Use the external tracking service instead of in-process tracking
    #[arg(short = 'S')]
    service: bool,

    /// Calibrate right after start
    #[arg(short = 'C')]
    calibrate: bool,

    /// Stop after this many seconds
    #[arg(short = 'd')]
    duration: Option<u64>,

    /// Experiment display size
    #[arg(long, default_value_t = 1920)]
    width: u32,
    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Write the control display to this PNG on exit
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Write the eye camera monitor to this PNG on exit
    #[arg(long)]
    eye_snapshot: Option<PathBuf>,
}

pub async fn desktop_main() {
    setup_logging();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        log::error!("{err}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), TrackerError> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::from_file(path)?,
        None => TrackerConfig::default(),
    };
    if let Some(camera) = &args.camera {
        config.camera = camera.clone();
    }
    config.validate()?;

    let tracker: Arc<dyn EyeTracker> = if args.service {
        Arc::new(ServiceTracker::launch(config.clone()).await?)
    } else {
        Arc::new(InProcessTracker::from_config(config.clone())?)
    };
    tracker.start().await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Interrupted");
                cancel.cancel();
            }
        });
    }

    // The render loop ends before the tracker is released.
    let session = render_loop(&args, &config, tracker.as_ref(), &cancel).await;
    let stopped = tracker.stop().await;
    session?;
    stopped
}

async fn render_loop(
    args: &Args,
    config: &TrackerConfig,
    tracker: &dyn EyeTracker,
    cancel: &CancellationToken,
) -> Result<(), TrackerError> {
    let mut experiment = CanvasSurface::new(args.width, args.height);
    let mut control = CanvasSurface::new(args.width / 2, args.height / 2);
    let (camera_width, camera_height) = tracker.frame_size();
    let mut eye = CanvasSurface::new(camera_width, camera_height);
    let mut input = StdinKeys::spawn();
    let mut clock = FrameClock::new(config.calibration.frame_rate);
    let overlay = GazeOverlay::default();
    let pupil_overlay = PupilOverlay::default();
    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    let mut calibrate = args.calibrate;
    log::info!(
        "Press '{}' to calibrate, '{QUIT_KEY}' to quit",
        config.calibration.hotkey
    );

    let result = loop {
        if calibrate {
            calibrate = false;
            let routine = CalibrationRoutine::new(
                config.calibration.clone(),
                config.confidence_threshold,
                &mut rand::thread_rng(),
            );
            let mut displays = Displays {
                experiment: &mut experiment,
                control: &mut control,
            };
            match routine.run(tracker, &mut displays, &mut input, &mut clock).await {
                Ok(RoutineOutcome::Calibrated(CalibrationOutcome::Skipped { samples, needed })) => {
                    log::warn!("Only {samples}/{needed} usable samples, still uncalibrated");
                }
                Ok(RoutineOutcome::Calibrated(outcome)) => log::info!("Calibration done: {outcome:?}"),
                Ok(RoutineOutcome::Aborted(reason)) => break Err(TrackerError::Device(reason)),
                Err(TrackerError::Calibration(err)) => {
                    log::warn!("Calibration failed ({err}), press '{}' to retry", config.calibration.hotkey);
                }
                Err(err) => break Err(err),
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            _ = clock.tick() => (),
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            log::info!("Session duration reached");
            break Ok(());
        }
        if let TrackerStatus::Failed(reason) = tracker.status() {
            break Err(TrackerError::Device(reason));
        }

        let mut quit = false;
        while let Some(key) = input.poll_key() {
            if key == config.calibration.hotkey {
                calibrate = true;
            } else if key == QUIT_KEY {
                quit = true;
            }
        }
        if quit {
            break Ok(());
        }

        experiment.clear(GREY);
        control.clear(BLACK);
        overlay.draw(tracker, &mut control);
        if let Some(sample) = tracker.latest_sample() {
            let top = control.size().1 as f32 / 2.0 - 20.0;
            control.draw_text(&format!("confidence {:.2}", sample.confidence), (0.0, top), WHITE);
        }
        eye.clear(BLACK);
        pupil_overlay.draw_tracker(tracker, &mut eye);
        experiment.present();
        control.present();
        eye.present();
    };

    if let Some(path) = &args.snapshot {
        control.save(path)?;
    }
    if let Some(path) = &args.eye_snapshot {
        eye.save(path)?;
    }
    result
}
