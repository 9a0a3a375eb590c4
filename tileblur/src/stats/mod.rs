//! Run statistics.
//!
//! The coordinator records a run-level timing record when it starts
//! publishing; per-image start times live on [`ImageInfo`] and completion
//! stamps are written by the assembler. This module owns the record type
//! and the end-of-run summary derived from it. Writing a separate
//! performance-report file is deliberately out of scope; the summary is
//! logged.
//!
//! [`ImageInfo`]: crate::store::ImageInfo

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Run-level timing record, stored in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTimings {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub kernel_size: u32,
    pub total_images: u32,
    pub input_paths: Vec<PathBuf>,
    pub output_paths: Vec<PathBuf>,
}

impl RunTimings {
    /// Starts a new timing record for a run over the given inputs.
    pub fn begin(kernel_size: u32, input_paths: Vec<PathBuf>, output_paths: Vec<PathBuf>) -> Self {
        Self {
            start_time: Utc::now(),
            end_time: None,
            kernel_size,
            total_images: input_paths.len() as u32,
            input_paths,
            output_paths,
        }
    }

    /// Stamps the end of the run.
    pub fn finish(&mut self) {
        self.end_time = Some(Utc::now());
    }

    /// Total wall-clock duration, if the run has finished.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// Per-image outcome for the end-of-run summary.
#[derive(Debug, Clone)]
pub struct ImageOutcome {
    pub image_id: u32,
    pub output_path: PathBuf,
    pub tiles: u32,
    pub started: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
}

/// Logs a human-readable completion summary for a run.
pub fn log_summary(timings: &RunTimings, outcomes: &[ImageOutcome]) {
    let completed = outcomes.iter().filter(|o| o.completed.is_some()).count();
    let total_tiles: u32 = outcomes.iter().map(|o| o.tiles).sum();

    tracing::info!(
        images = outcomes.len(),
        completed,
        total_tiles,
        kernel_size = timings.kernel_size,
        "run summary"
    );

    for outcome in outcomes {
        match outcome.completed {
            Some(end) => {
                let secs = (end - outcome.started).num_milliseconds() as f64 / 1000.0;
                tracing::info!(
                    image_id = outcome.image_id,
                    output = %outcome.output_path.display(),
                    tiles = outcome.tiles,
                    elapsed_secs = secs,
                    "image complete"
                );
            }
            None => {
                tracing::warn!(
                    image_id = outcome.image_id,
                    tiles = outcome.tiles,
                    "image not completed"
                );
            }
        }
    }

    if let Some(elapsed) = timings.elapsed() {
        tracing::info!(
            elapsed_secs = elapsed.num_milliseconds() as f64 / 1000.0,
            "run finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_counts_inputs() {
        let timings = RunTimings::begin(
            15,
            vec![PathBuf::from("a.png"), PathBuf::from("b.png")],
            vec![PathBuf::from("a_out.png"), PathBuf::from("b_out.png")],
        );
        assert_eq!(timings.total_images, 2);
        assert!(timings.end_time.is_none());
        assert!(timings.elapsed().is_none());
    }

    #[test]
    fn test_finish_stamps_end() {
        let mut timings = RunTimings::begin(3, vec![], vec![]);
        timings.finish();
        assert!(timings.end_time.is_some());
        assert!(timings.elapsed().unwrap() >= chrono::Duration::zero());
    }

    #[test]
    fn test_timings_serde_round_trip() {
        let mut timings = RunTimings::begin(7, vec![PathBuf::from("x.png")], vec![]);
        timings.finish();
        let json = serde_json::to_string(&timings).unwrap();
        let back: RunTimings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kernel_size, 7);
        assert_eq!(back.total_images, 1);
        assert_eq!(back.end_time, timings.end_time);
    }
}
