//! Coordinator: turns input images into tile jobs.
//!
//! For each discovered input the coordinator decodes the image, computes
//! its tiling grid, persists the image's metadata record, and publishes
//! one job per tile to the job stream. Images are processed concurrently;
//! a decode failure skips that image without aborting its siblings, while
//! a publish failure is surfaced as an error — a tile job is never
//! silently dropped.
//!
//! The coordinator does not publish in-band completion sentinels: workers
//! and assemblers run until externally cancelled, so there is no "how many
//! done messages" ambiguity.

use crate::config::Settings;
use crate::message::{
    JobMessage, MessageError, ASSEMBLER_GROUP, JOB_STREAM, RESULT_STREAM, WORKER_GROUP,
};
use crate::queue::{QueueError, WorkQueue};
use crate::raster::{self, RasterError};
use crate::stats::RunTimings;
use crate::store::{ImageInfo, MetadataStore, StoreError};
use crate::tile::{self, TileError, TileGrid};
use chrono::Utc;
use std::path::PathBuf;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Coordinator errors.
///
/// Per-image decode failures are contained (logged and skipped) and never
/// surface here; these variants are run-fatal conditions.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Image file handling failed. Decode failures inside one image are
    /// contained and skipped; this surfaces only for input discovery.
    #[error("image file error: {0}")]
    Raster(#[from] RasterError),

    /// The work queue rejected an operation.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The metadata store rejected an operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Tiling failed (invalid configuration).
    #[error(transparent)]
    Tile(#[from] TileError),

    /// A job envelope could not be encoded.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// A decode/split task died.
    #[error("internal task failure: {0}")]
    Internal(String),
}

/// Publishes tile jobs for a batch of images.
pub struct Coordinator<Q, S> {
    queue: Q,
    store: S,
    settings: Settings,
}

impl<Q, S> Coordinator<Q, S>
where
    Q: WorkQueue,
    S: MetadataStore,
{
    /// Creates a coordinator over the given transport and store.
    pub fn new(queue: Q, store: S, settings: Settings) -> Self {
        Self {
            queue,
            store,
            settings,
        }
    }

    /// Discovers inputs in the configured directory and publishes their
    /// tile jobs.
    ///
    /// Returns the metadata records of every image whose tiles were
    /// published (skipped images are absent).
    pub async fn run(&self) -> Result<Vec<ImageInfo>, CoordinatorError> {
        let paths = raster::discover_images(&self.settings.input_dir)?;
        if paths.is_empty() {
            warn!(dir = %self.settings.input_dir.display(), "no input images found");
        }
        self.process_images(paths).await
    }

    /// Publishes tile jobs for an explicit list of input paths.
    ///
    /// Image ids are positions in `paths`, so they are stable for a given
    /// input list. Images are decoded and published concurrently.
    pub async fn process_images(
        &self,
        paths: Vec<PathBuf>,
    ) -> Result<Vec<ImageInfo>, CoordinatorError> {
        self.queue.ensure_group(JOB_STREAM, WORKER_GROUP).await?;
        self.queue
            .ensure_group(RESULT_STREAM, ASSEMBLER_GROUP)
            .await?;

        let output_paths: Vec<PathBuf> = paths
            .iter()
            .map(|p| raster::output_path_for(p, &self.settings.output_dir))
            .collect();
        let timings = RunTimings::begin(
            self.settings.kernel_size,
            paths.clone(),
            output_paths.clone(),
        );
        self.store.put_timings(&timings).await?;

        let mut tasks: JoinSet<Result<Option<ImageInfo>, CoordinatorError>> = JoinSet::new();
        for (image_id, (input, output)) in paths.into_iter().zip(output_paths).enumerate() {
            let queue = self.queue.clone();
            let store = self.store.clone();
            let settings = self.settings.clone();
            tasks.spawn(process_image(
                queue,
                store,
                settings,
                image_id as u32,
                input,
                output,
            ));
        }

        let mut infos = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| CoordinatorError::Internal(e.to_string()))?;
            if let Some(info) = result? {
                infos.push(info);
            }
        }

        infos.sort_by_key(|info| info.id);
        info!(images = infos.len(), "coordinator finished publishing");
        Ok(infos)
    }
}

/// Decodes one image, persists its metadata, and publishes its tile jobs.
///
/// Returns `Ok(None)` when the image is skipped (decode failure).
async fn process_image<Q, S>(
    queue: Q,
    store: S,
    settings: Settings,
    image_id: u32,
    input: PathBuf,
    output: PathBuf,
) -> Result<Option<ImageInfo>, CoordinatorError>
where
    Q: WorkQueue,
    S: MetadataStore,
{
    let tile_edge = settings.tile_edge;
    let padding = settings.padding();

    // Decode and split off the async runtime; both walk every pixel.
    let load_path = input.clone();
    let loaded = tokio::task::spawn_blocking(move || {
        let image = raster::load_image(&load_path)?;
        let tiles = tile::split(&image, image_id, tile_edge, padding)?;
        Ok::<_, CoordinatorError>((image.width(), image.height(), tiles))
    })
    .await
    .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

    let (width, height, tiles) = match loaded {
        Ok(parts) => parts,
        Err(CoordinatorError::Raster(e)) => {
            // Decode failure skips this image only.
            warn!(image_id, path = %input.display(), error = %e, "skipping undecodable image");
            return Ok(None);
        }
        Err(other) => return Err(other),
    };

    let expected_tiles = TileGrid::new(width, height, tile_edge)?.tile_count();
    let info = ImageInfo {
        id: image_id,
        input_path: input,
        output_path: output,
        width,
        height,
        expected_tiles,
        start_time: Utc::now(),
    };

    // The metadata record must be readable before any tile job for this
    // image can reach the assembler.
    store.put_image_info(&info).await?;

    for tile in &tiles {
        let payload = JobMessage::from_tile(tile).encode()?;
        queue.publish(JOB_STREAM, payload).await?;
    }

    info!(
        image_id,
        width, height, expected_tiles, "enqueued tiles for image"
    );
    Ok(Some(info))
}
