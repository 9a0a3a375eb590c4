//! Tileblur - fault-tolerant distributed tile-blur pipeline.
//!
//! This library blurs batches of images by partitioning each one into
//! overlapping tiles, blurring the tiles on a pool of workers, and
//! reassembling the results — with every hand-off flowing through a
//! durable, at-least-once work queue so that a crashed worker or
//! assembler never loses a tile.
//!
//! # Architecture
//!
//! ```text
//! Coordinator → (job stream) → Worker Pool → (result stream) → Assembler → files
//! ```
//!
//! Components interact only through the [`queue::WorkQueue`] and
//! [`store::MetadataStore`] traits; swapping the in-memory transport for
//! the Redis one turns the single-process pipeline into the distributed
//! deployment without touching the components.
//!
//! # Example
//!
//! ```ignore
//! use tileblur::config::Settings;
//! use tileblur::local::run_pipeline;
//!
//! let settings = Settings::default()
//!     .with_input_dir("input")
//!     .with_output_dir("output")
//!     .with_kernel_size(15);
//!
//! let summary = run_pipeline(&settings).await?;
//! println!("blurred {} images", summary.images_completed);
//! ```

pub mod assembler;
pub mod blur;
pub mod config;
pub mod coordinator;
pub mod local;
pub mod logging;
pub mod message;
pub mod queue;
pub mod raster;
pub mod stats;
pub mod store;
pub mod tile;
pub mod worker;

/// Version of the tileblur library and CLI.
///
/// Synchronized across all components in the workspace; defined in
/// `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
