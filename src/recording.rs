use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use image::codecs::jpeg::JpegEncoder;

use crate::camera::Frame;
use crate::structs::{CalibrationDataset, GazePoint, PupilSample, unix_seconds};

pub const CALIBRATION_DATA_FILE: &str = "calibration_data.txt";

const JPEG_QUALITY: u8 = 85;

/// `Y_m_d_H_M_S` in local time, shared by every artifact of one session.
pub fn session_stem(timestamp: SystemTime) -> String {
    let timestamp: chrono::DateTime<chrono::Local> = timestamp.into();
    timestamp.format("%Y_%m_%d_%H_%M_%S").to_string()
}

pub fn session_path(output_dir: &Path, stem: &str, suffix: &str) -> PathBuf {
    output_dir.join(format!("{stem}{suffix}"))
}

/// `timestamp, x, y, diameter, confidence[, gaze_x, gaze_y]`
///
/// `gaze` is `None` while uncalibrated, `Some(None)` for a calibrated frame
/// without a usable pupil.
pub fn format_sample_line(sample: &PupilSample, gaze: Option<Option<GazePoint>>) -> String {
    let mut line = format!(
        "{:.6}, {:.6}, {:.6}, {:.6}, {:.6}",
        unix_seconds(sample.timestamp),
        sample.norm_pos.0,
        sample.norm_pos.1,
        sample.diameter,
        sample.confidence
    );
    match gaze {
        Some(Some(gaze)) => line.push_str(&format!(", {:.6}, {:.6}", gaze.x, gaze.y)),
        Some(None) => line.push_str(", NaN, NaN"),
        None => (),
    }
    line
}

/// Eye camera video as concatenated JPEG frames, plus an index of frame
/// timestamps.
pub struct MjpegWriter {
    video: BufWriter<File>,
    index: BufWriter<File>,
    frames: u64,
}

impl MjpegWriter {
    pub fn create(video_path: &Path, index_path: &Path) -> io::Result<Self> {
        Ok(Self {
            video: BufWriter::new(File::create(video_path)?),
            index: BufWriter::new(File::create(index_path)?),
            frames: 0,
        })
    }

    pub fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        match &frame.raw_jpeg_data {
            Some(jpeg) => self.video.write_all(jpeg)?,
            None => JpegEncoder::new_with_quality(&mut self.video, JPEG_QUALITY)
                .encode_image(&frame.pixels)
                .map_err(io::Error::other)?,
        }
        writeln!(
            self.index,
            "{} {:.6}",
            frame.index,
            unix_seconds(frame.timestamp)
        )?;
        self.frames += 1;
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.video.flush()?;
        self.index.flush()
    }
}

/// Video and per-sample log of one in-process session.
pub struct SessionRecorder {
    video: MjpegWriter,
    log: BufWriter<File>,
    log_path: PathBuf,
}

impl SessionRecorder {
    pub fn create(output_dir: &Path, stem: &str) -> io::Result<Self> {
        fs::create_dir_all(output_dir)?;
        let video = MjpegWriter::create(
            &session_path(output_dir, stem, ".mjpeg"),
            &session_path(output_dir, stem, "_frames.txt"),
        )?;
        let log_path = session_path(output_dir, stem, ".log");
        let log = BufWriter::new(File::create(&log_path)?);
        log::info!("Recording eye tracking to {}", log_path.display());
        Ok(Self {
            video,
            log,
            log_path,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn log_sample(
        &mut self,
        sample: &PupilSample,
        gaze: Option<Option<GazePoint>>,
    ) -> io::Result<()> {
        writeln!(self.log, "{}", format_sample_line(sample, gaze))
    }

    pub fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.video.write_frame(frame)
    }

    pub fn finish(mut self) -> io::Result<()> {
        log::info!(
            "Closing eye tracking recording, {} video frames",
            self.video.frames()
        );
        self.log.flush()?;
        self.video.finish()
    }
}

/// `pupil_x pupil_y ref_x ref_y` per pair, overwritten on each fit.
pub fn write_calibration_points(path: &Path, dataset: &CalibrationDataset) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for pair in dataset.pairs() {
        writeln!(
            out,
            "{:.6} {:.6} {:.6} {:.6}",
            pair.pupil.norm_pos.0,
            pair.pupil.norm_pos.1,
            pair.reference.position.0,
            pair.reference.position.1
        )?;
    }
    out.flush()
}

/// Returns `false` without touching anything when `from` does not exist.
pub fn rename_artifact(from: &Path, to: &Path) -> io::Result<bool> {
    if !from.exists() {
        log::debug!("No {} to rename", from.display());
        return Ok(false);
    }
    fs::rename(from, to)?;
    log::info!("Saved {}", to.display());
    Ok(true)
}
