#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use eyetrack_session::camera::{Frame, FrameSource, SourceOpener};
use eyetrack_session::config::TrackerConfig;
use eyetrack_session::error::TrackerError;
use image::{GrayImage, Luma};

pub const RESOLUTION: (u32, u32) = (320, 240);

#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Dark disk on a bright background, centre in pixels.
    Pupil { center: (f32, f32), radius: f32 },
    /// Half-size frame, too small for a full-frame region.
    Shrunk,
    Drop,
    Fail,
}

pub fn disk_frame(resolution: (u32, u32), center: (f32, f32), radius: f32) -> GrayImage {
    GrayImage::from_fn(resolution.0, resolution.1, |x, y| {
        let dx = x as f32 + 0.5 - center.0;
        let dy = y as f32 + 0.5 - center.1;
        if dx * dx + dy * dy <= radius * radius {
            Luma([20])
        } else {
            Luma([200])
        }
    })
}

/// Plays a fixed script, then reports the device as gone.
pub struct ScriptedSource {
    resolution: (u32, u32),
    script: VecDeque<ScriptStep>,
    index: u64,
}

impl FrameSource for ScriptedSource {
    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, TrackerError> {
        std::thread::sleep(Duration::from_millis(1));
        match self.script.pop_front().unwrap_or(ScriptStep::Fail) {
            ScriptStep::Pupil { center, radius } => {
                self.index += 1;
                let pixels = disk_frame(self.resolution, center, radius);
                Ok(Some(Frame::new(pixels, SystemTime::now(), self.index)))
            }
            ScriptStep::Shrunk => {
                self.index += 1;
                let size = (self.resolution.0 / 2, self.resolution.1 / 2);
                let pixels = disk_frame(size, (40.0, 30.0), 10.0);
                Ok(Some(Frame::new(pixels, SystemTime::now(), self.index)))
            }
            ScriptStep::Drop => Ok(None),
            ScriptStep::Fail => Err(TrackerError::Device("script finished".to_string())),
        }
    }
}

pub fn scripted_opener(script: Vec<ScriptStep>) -> SourceOpener {
    Arc::new(move || {
        Ok(Box::new(ScriptedSource {
            resolution: RESOLUTION,
            script: script.clone().into(),
            index: 0,
        }) as Box<dyn FrameSource>)
    })
}

pub fn test_config(output_dir: &Path) -> TrackerConfig {
    TrackerConfig {
        resolution: RESOLUTION,
        output_dir: output_dir.to_path_buf(),
        ..TrackerConfig::default()
    }
}

pub async fn wait_for(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn find_file(dir: &Path, suffix: &str) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(suffix))
        })
}

/// Per-sample log as numbers, one row per line.
pub fn read_sample_log(dir: &Path) -> Vec<Vec<f64>> {
    let path = find_file(dir, ".log").expect("no sample log written");
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| {
            line.split(", ")
                .map(|column| column.parse::<f64>().unwrap())
                .collect()
        })
        .collect()
}
