//! Single-process execution modes.
//!
//! The distributed pipeline and the in-process variants are the same three
//! components over different transports. [`run_pipeline`] wires the
//! coordinator, worker pool, and assembler to the in-memory queue and
//! store inside one process — the tile-parallel and pipelined variants
//! fall out of the worker count and the coordinator's concurrent
//! publishing. [`run_sequential`] is the queue-free baseline: decode,
//! blur, save, one image at a time.

mod pipeline;
mod sequential;

pub use pipeline::run_pipeline;
pub use sequential::run_sequential;

use crate::assembler::AssemblerError;
use crate::blur::BlurError;
use crate::config::SettingsError;
use crate::coordinator::CoordinatorError;
use crate::queue::QueueError;
use crate::raster::RasterError;
use crate::store::StoreError;
use crate::worker::WorkerError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the single-process execution modes.
#[derive(Debug, Error)]
pub enum LocalError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Blur(#[from] BlurError),

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Assembler(#[from] AssemblerError),

    #[error("internal task failure: {0}")]
    Internal(String),
}

/// Outcome of a single-process run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Images whose output was written.
    pub images_completed: usize,
    /// Images discovered in the input directory.
    pub images_discovered: usize,
    /// Output paths written.
    pub outputs: Vec<PathBuf>,
}
