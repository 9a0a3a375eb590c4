//! In-process metadata store.

use super::{ImageInfo, MetadataStore, StoreError};
use crate::stats::RunTimings;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory metadata store backing the single-process modes and tests.
///
/// Cheap to clone; all clones share the same state. The received-tile sets
/// use sharded concurrent maps so test-and-insert is atomic without any
/// caller-side locking.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    infos: DashMap<u32, ImageInfo>,
    received: DashMap<u32, DashSet<u32>>,
    completed: DashMap<u32, DateTime<Utc>>,
    timings: RwLock<Option<RunTimings>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    async fn put_image_info(&self, info: &ImageInfo) -> Result<(), StoreError> {
        self.inner.infos.insert(info.id, info.clone());
        Ok(())
    }

    async fn image_info(&self, image_id: u32) -> Result<Option<ImageInfo>, StoreError> {
        Ok(self.inner.infos.get(&image_id).map(|r| r.clone()))
    }

    async fn mark_tile_received(&self, image_id: u32, tile_id: u32) -> Result<bool, StoreError> {
        let set = self.inner.received.entry(image_id).or_default();
        Ok(set.insert(tile_id))
    }

    async fn received_count(&self, image_id: u32) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .received
            .get(&image_id)
            .map(|s| s.len() as u64)
            .unwrap_or(0))
    }

    async fn mark_completed(&self, image_id: u32) -> Result<(), StoreError> {
        self.inner
            .completed
            .entry(image_id)
            .or_insert_with(Utc::now);
        Ok(())
    }

    async fn completed_at(&self, image_id: u32) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.inner.completed.get(&image_id).map(|r| *r))
    }

    async fn put_timings(&self, timings: &RunTimings) -> Result<(), StoreError> {
        *self.inner.timings.write().await = Some(timings.clone());
        Ok(())
    }

    async fn timings(&self) -> Result<Option<RunTimings>, StoreError> {
        Ok(self.inner.timings.read().await.clone())
    }
}
