use arc_swap::ArcSwap;

use crate::structs::{GazePoint, PupilSample};

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct TrackerSnapshot {
    pub sample: Option<PupilSample>,
    pub gaze: Option<GazePoint>,
}

/// Latest tracker output. Written by the tracker's own thread, read from
/// anywhere without blocking. Every update swaps in a whole new snapshot.
#[derive(Debug, Default)]
pub struct SharedTrackerState {
    cell: ArcSwap<TrackerSnapshot>,
}

impl SharedTrackerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        **self.cell.load()
    }

    pub fn publish(&self, sample: PupilSample, gaze: Option<GazePoint>) {
        self.cell.store(std::sync::Arc::new(TrackerSnapshot {
            sample: Some(sample),
            gaze,
        }));
    }

    /// Replaces the pupil half, keeps the gaze.
    pub fn update_sample(&self, sample: PupilSample) {
        self.cell.rcu(|current| TrackerSnapshot {
            sample: Some(sample),
            ..**current
        });
    }

    /// Replaces the gaze half, keeps the pupil.
    pub fn update_gaze(&self, gaze: GazePoint) {
        self.cell.rcu(|current| TrackerSnapshot {
            gaze: Some(gaze),
            ..**current
        });
    }
}
