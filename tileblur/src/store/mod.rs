//! Shared metadata store.
//!
//! Holds the per-image records every pipeline role reads: image geometry
//! and expected tile counts (written by the coordinator), the persisted
//! received-tile sets the assembler deduplicates against, completion
//! stamps, and the run-level timing record. The store is the second of the
//! two shared mutable surfaces in the system (the first being the work
//! queue); all mutation goes through its atomic primitives — components
//! never lock across process boundaries.

mod memory;
mod redis;

pub use self::redis::RedisStore;
pub use memory::MemoryStore;

use crate::stats::RunTimings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;

/// Per-image metadata, persisted by the coordinator before any tile job
/// for the image is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: u32,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Number of distinct tiles the assembler must receive before saving.
    pub expected_tiles: u32,
    pub start_time: DateTime<Utc>,
}

/// Metadata store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached.
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    /// The backing store rejected an operation.
    #[error("metadata store error: {0}")]
    Backend(String),

    /// A stored record could not be decoded.
    #[error("corrupt metadata record: {0}")]
    Corrupt(String),
}

/// Durable, shared metadata accessible to every pipeline role.
pub trait MetadataStore: Clone + Send + Sync + 'static {
    /// Persists the metadata record for an image, keyed by its id.
    fn put_image_info(
        &self,
        info: &ImageInfo,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Fetches the metadata record for an image.
    fn image_info(
        &self,
        image_id: u32,
    ) -> impl Future<Output = Result<Option<ImageInfo>, StoreError>> + Send;

    /// Atomically test-and-inserts a tile into the image's received set.
    ///
    /// Returns `true` if the tile was newly inserted. Two callers racing
    /// on the same `(image_id, tile_id)` see exactly one `true`; the loser
    /// must treat the tile as already applied.
    fn mark_tile_received(
        &self,
        image_id: u32,
        tile_id: u32,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Cardinality of the image's received-tile set.
    fn received_count(
        &self,
        image_id: u32,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Records that the image's output has been persisted.
    ///
    /// Idempotent: the first stamp wins.
    fn mark_completed(&self, image_id: u32)
        -> impl Future<Output = Result<(), StoreError>> + Send;

    /// When the image's output was persisted, if it has been.
    fn completed_at(
        &self,
        image_id: u32,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, StoreError>> + Send;

    /// Stores the run-level timing record.
    fn put_timings(
        &self,
        timings: &RunTimings,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Fetches the run-level timing record.
    fn timings(&self) -> impl Future<Output = Result<Option<RunTimings>, StoreError>> + Send;
}
