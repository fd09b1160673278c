use serde::{Deserialize, Serialize};

use crate::models::media::MediaRef;

/// Half-open time span in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }
}

/// Rendered output of the compositing stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeResult {
    pub output_video: MediaRef,
    /// Span of source time that was eligible for compositing.
    pub modified_range: TimeRange,
    pub total_frames: usize,
    pub window_frames: usize,
    pub frames_composited: usize,
    /// Frames left untouched because the footprint hit an avoid region.
    pub frames_skipped: usize,
    /// Composited frames whose footprint came within the safety margin of an
    /// avoid region.
    pub near_misses: usize,
    pub output_duration: f64,
    pub audio_preserved: bool,
    pub trimmed: bool,
    /// Skipped fraction exceeded the geometry threshold.
    pub geometry_degraded: bool,
}

impl CompositeResult {
    /// Fraction of the window that was actually rendered.
    pub fn coverage(&self) -> f64 {
        if self.window_frames == 0 {
            0.0
        } else {
            self.frames_composited as f64 / self.window_frames as f64
        }
    }

    pub fn skipped_fraction(&self) -> f64 {
        if self.window_frames == 0 {
            0.0
        } else {
            self.frames_skipped as f64 / self.window_frames as f64
        }
    }
}
