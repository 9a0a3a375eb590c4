//! Pipeline configuration.
//!
//! One [`Settings`] struct covers every execution mode; distributed roles
//! ignore the fields they do not use (the sequential baseline never reads
//! `queue_addr`). Builder methods keep call sites readable and defaults
//! sensible.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default blur kernel edge length.
pub const DEFAULT_KERNEL_SIZE: u32 = 15;

/// Default tile edge length in pixels.
pub const DEFAULT_TILE_EDGE: u32 = 256;

/// Default number of concurrent workers in one pool.
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// Default blocking-read timeout against the queue.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default visibility timeout before an unacked message is reclaimable.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between reclaim sweeps.
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum messages claimed per reclaim sweep.
pub const DEFAULT_RECLAIM_BATCH: usize = 50;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Kernel size must be odd so the kernel has a center pixel.
    #[error("kernel size must be odd and non-zero, got {0}")]
    InvalidKernelSize(u32),

    /// Tile edge length must be non-zero.
    #[error("tile edge length must be greater than zero")]
    InvalidTileEdge,

    /// Worker count must be non-zero.
    #[error("worker count must be greater than zero")]
    InvalidWorkerCount,
}

/// Settings shared by every pipeline role.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory scanned for input images.
    pub input_dir: PathBuf,
    /// Directory receiving blurred outputs.
    pub output_dir: PathBuf,
    /// Blur kernel edge length (odd); padding is half of this.
    pub kernel_size: u32,
    /// Tile edge length in pixels.
    pub tile_edge: u32,
    /// Concurrent workers in one pool instance.
    pub worker_count: usize,
    /// Queue/metadata backend address (distributed modes only).
    pub queue_addr: String,
    /// Run identifier; namespaces queue streams and metadata keys.
    pub run_id: String,
    /// How long a blocking read waits before returning empty.
    pub block_timeout: Duration,
    /// Idle time after which an unacked message is reclaimable.
    pub visibility_timeout: Duration,
    /// Interval between reclaim sweeps.
    pub reclaim_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("input"),
            output_dir: PathBuf::from("output"),
            kernel_size: DEFAULT_KERNEL_SIZE,
            tile_edge: DEFAULT_TILE_EDGE,
            worker_count: DEFAULT_WORKER_COUNT,
            queue_addr: String::from("redis://127.0.0.1:6379"),
            run_id: String::from("tileblur"),
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
        }
    }
}

impl Settings {
    /// Sets the input directory.
    pub fn with_input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.input_dir = dir.into();
        self
    }

    /// Sets the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Sets the blur kernel size.
    pub fn with_kernel_size(mut self, size: u32) -> Self {
        self.kernel_size = size;
        self
    }

    /// Sets the tile edge length.
    pub fn with_tile_edge(mut self, edge: u32) -> Self {
        self.tile_edge = edge;
        self
    }

    /// Sets the worker count.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets the queue backend address.
    pub fn with_queue_addr(mut self, addr: impl Into<String>) -> Self {
        self.queue_addr = addr.into();
        self
    }

    /// Sets the run identifier.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Sets the blocking-read timeout.
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Sets the visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Sets the reclaim sweep interval.
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Tile padding implied by the kernel: half its edge length.
    #[inline]
    pub fn padding(&self) -> u32 {
        self.kernel_size / 2
    }

    /// Checks invariants the pipeline relies on.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(SettingsError::InvalidKernelSize(self.kernel_size));
        }
        if self.tile_edge == 0 {
            return Err(SettingsError::InvalidTileEdge);
        }
        if self.worker_count == 0 {
            return Err(SettingsError::InvalidWorkerCount);
        }
        Ok(())
    }
}
