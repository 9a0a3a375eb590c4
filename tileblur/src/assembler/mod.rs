//! Assembler: reconstructs complete images from blurred tiles.
//!
//! The assembler consumes the result stream and runs one small state
//! machine per image, keyed by image id in an explicit map:
//!
//! - first tile for an unseen image fetches the image's metadata record
//!   and allocates an output canvas;
//! - every tile is gated by an atomic test-and-insert into the persisted
//!   received-tile set, so duplicate deliveries (the price of at-least-once
//!   transport) are acknowledged and discarded without reapplying;
//! - new tiles are merged into the canvas before their delivery is acked;
//! - once the received count reaches the expected tile count the canvas is
//!   encoded to disk, the image is marked completed, and its in-memory
//!   state is released.
//!
//! An image is saved if and only if every expected tile has been received
//! at least once — never a proper subset. Deliveries that arrive after
//! completion (a very late duplicate) are detected via the completion
//! stamp and discarded without re-allocating state.

use crate::config::{Settings, DEFAULT_RECLAIM_BATCH};
use crate::message::{ResultMessage, ASSEMBLER_GROUP, RESULT_STREAM};
use crate::queue::{Delivery, QueueError, WorkQueue};
use crate::raster;
use crate::store::{ImageInfo, MetadataStore, StoreError};
use crate::tile;
use image::RgbaImage;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive queue failures the assembler tolerates before giving up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Pause between retries after a failed read.
const READ_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Assembler errors. Per-tile problems are contained (malformed results
/// are acked and skipped, missing metadata leaves the delivery for
/// redelivery); these variants are loop-fatal conditions.
#[derive(Debug, Error)]
pub enum AssemblerError {
    /// The queue stayed unreachable past the retry budget.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The metadata store rejected an operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A save task died.
    #[error("internal task failure: {0}")]
    Internal(String),
}

/// In-memory assembly state for one image.
struct Assembly {
    info: ImageInfo,
    canvas: RgbaImage,
    /// Tiles merged into this canvas by this assembler instance.
    ///
    /// Kept separately from the persisted received count: after an
    /// assembler restart mid-image, tiles merged and acked by the previous
    /// instance are in the received set but not on this canvas, and such
    /// an image must never be saved with holes.
    merged: u32,
}

/// Consumes blurred tiles and writes completed images.
pub struct Assembler<Q, S> {
    queue: Q,
    store: S,
    settings: Settings,
    consumer: String,
}

impl<Q, S> Assembler<Q, S>
where
    Q: WorkQueue,
    S: MetadataStore,
{
    /// Creates an assembler over the given transport and store.
    pub fn new(queue: Q, store: S, settings: Settings) -> Self {
        Self {
            queue,
            store,
            settings,
            consumer: String::from("assembler"),
        }
    }

    /// Overrides the consumer name.
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Runs the assembly loop until the token is cancelled.
    ///
    /// Besides reading fresh results, the loop periodically reclaims
    /// result deliveries left pending by a crashed assembler instance.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AssemblerError> {
        self.queue
            .ensure_group(RESULT_STREAM, ASSEMBLER_GROUP)
            .await?;

        let mut assemblies: HashMap<u32, Assembly> = HashMap::new();
        let mut consecutive_errors = 0u32;
        let mut reclaim_tick = tokio::time::interval(self.settings.reclaim_interval);
        reclaim_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup reads fresh
        // results before sweeping for stale ones.
        reclaim_tick.tick().await;

        info!(consumer = %self.consumer, "assembler started");

        loop {
            let read = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = reclaim_tick.tick() => {
                    self.reclaim_results(&mut assemblies).await?;
                    continue;
                }
                read = self.queue.read(
                    RESULT_STREAM,
                    ASSEMBLER_GROUP,
                    &self.consumer,
                    self.settings.block_timeout,
                ) => read,
            };

            match read {
                Ok(Some(delivery)) => {
                    consecutive_errors = 0;
                    self.handle_delivery(&mut assemblies, delivery).await?;
                }
                Ok(None) => {
                    consecutive_errors = 0;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(e.into());
                    }
                    warn!(error = %e, "result read failed, retrying");
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                }
            }
        }

        info!(
            in_flight = assemblies.len(),
            "assembler stopped"
        );
        Ok(())
    }

    /// Sweeps the result stream for deliveries abandoned by a crashed
    /// assembler and processes them.
    async fn reclaim_results(
        &self,
        assemblies: &mut HashMap<u32, Assembly>,
    ) -> Result<(), AssemblerError> {
        let reclaimed = self
            .queue
            .reclaim_stale(
                RESULT_STREAM,
                ASSEMBLER_GROUP,
                &self.consumer,
                self.settings.visibility_timeout,
                DEFAULT_RECLAIM_BATCH,
            )
            .await;

        match reclaimed {
            Ok(deliveries) => {
                if !deliveries.is_empty() {
                    info!(count = deliveries.len(), "reclaimed stale results");
                }
                for delivery in deliveries {
                    self.handle_delivery(assemblies, delivery).await?;
                }
            }
            Err(e) => warn!(error = %e, "result reclaim sweep failed"),
        }
        Ok(())
    }

    /// Applies one result delivery to the per-image state machine.
    async fn handle_delivery(
        &self,
        assemblies: &mut HashMap<u32, Assembly>,
        delivery: Delivery,
    ) -> Result<(), AssemblerError> {
        let message = match ResultMessage::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(message_id = %delivery.id, error = %e, "malformed result, acknowledging and skipping");
                return self.ack(&delivery).await;
            }
        };
        let worker_id = message.worker_id.clone();
        let processing_ms = message.processing_ms;

        let tile = match message.into_processed() {
            Ok(tile) => tile,
            Err(e) => {
                warn!(message_id = %delivery.id, worker_id, error = %e, "invalid result payload, acknowledging and skipping");
                return self.ack(&delivery).await;
            }
        };
        let image_id = tile.image_id;

        // A delivery for an image whose output is already on disk is a
        // very late duplicate: discard without re-allocating a canvas.
        if self.store.completed_at(image_id).await?.is_some() {
            debug!(image_id, tile_id = tile.tile_id, "tile for completed image, discarding");
            return self.ack(&delivery).await;
        }

        // First tile for an unseen image: fetch metadata, allocate canvas.
        if !assemblies.contains_key(&image_id) {
            let Some(info) = self.store.image_info(image_id).await? else {
                // The coordinator's record is not visible yet; leave the
                // delivery pending so redelivery retries later.
                warn!(image_id, "image info missing, leaving result for redelivery");
                return Ok(());
            };
            let already_received = self.store.received_count(image_id).await?;
            if already_received > 0 {
                // A previous assembler instance applied tiles and died;
                // those deliveries were acked and will not replay. The
                // image cannot complete from here and is never saved
                // partially — it needs its jobs re-published.
                warn!(
                    image_id,
                    already_received,
                    "assembler restart detected, previously applied tiles cannot be replayed"
                );
            }
            let canvas = RgbaImage::new(info.width, info.height);
            assemblies.insert(
                image_id,
                Assembly {
                    info,
                    canvas,
                    merged: 0,
                },
            );
        }
        // The entry was either present or just inserted.
        let Some(assembly) = assemblies.get_mut(&image_id) else {
            return Err(AssemblerError::Internal(format!(
                "assembly state vanished for image {image_id}"
            )));
        };

        // Geometry that cannot land on this canvas means a corrupt
        // result; treat it as malformed before it can enter the set.
        if tile.x + tile.width > assembly.info.width || tile.y + tile.height > assembly.info.height
        {
            warn!(
                image_id,
                tile_id = tile.tile_id,
                "result tile outside image bounds, acknowledging and skipping"
            );
            return self.ack(&delivery).await;
        }

        // Atomic test-and-insert: exactly one delivery of each tile wins.
        if !self.store.mark_tile_received(image_id, tile.tile_id).await? {
            debug!(image_id, tile_id = tile.tile_id, "duplicate tile, discarding");
            return self.ack(&delivery).await;
        }

        // Durable apply before ack: the merge (and the persisted set
        // insert above) happen before the delivery is acknowledged.
        if let Err(e) = tile::merge(&mut assembly.canvas, &tile) {
            return Err(AssemblerError::Internal(e.to_string()));
        }
        assembly.merged += 1;
        self.ack(&delivery).await?;

        debug!(
            image_id,
            tile_id = tile.tile_id,
            worker_id,
            processing_ms,
            "tile merged"
        );

        let received = self.store.received_count(image_id).await?;
        if received >= u64::from(assembly.info.expected_tiles) {
            if assembly.merged == assembly.info.expected_tiles {
                self.complete_image(assemblies, image_id).await?;
            } else {
                // Every tile was received at least once across assembler
                // lifetimes, but this canvas is missing some of them.
                // Saving would produce a partial image; not saving keeps
                // the loss observable via the absent completion stamp.
                warn!(
                    image_id,
                    merged = assembly.merged,
                    expected = assembly.info.expected_tiles,
                    "all tiles received but canvas is incomplete, refusing to save"
                );
            }
        }

        Ok(())
    }

    /// Encodes and persists a fully assembled image, then releases its
    /// in-memory state.
    async fn complete_image(
        &self,
        assemblies: &mut HashMap<u32, Assembly>,
        image_id: u32,
    ) -> Result<(), AssemblerError> {
        let Some(assembly) = assemblies.remove(&image_id) else {
            return Ok(());
        };
        let Assembly { info, canvas, .. } = assembly;

        let output_path = info.output_path.clone();
        let save_path = output_path.clone();
        let saved = tokio::task::spawn_blocking(move || raster::save_image(&canvas, &save_path))
            .await
            .map_err(|e| AssemblerError::Internal(e.to_string()))?;

        match saved {
            Ok(()) => {
                self.store.mark_completed(image_id).await?;
                info!(
                    image_id,
                    tiles = info.expected_tiles,
                    output = %output_path.display(),
                    "image saved"
                );
            }
            Err(e) => {
                // Containment: a failed save loses this image only, and
                // the missing completion stamp keeps the loss observable.
                error!(image_id, output = %output_path.display(), error = %e, "failed to save assembled image");
            }
        }

        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AssemblerError> {
        self.queue
            .ack(RESULT_STREAM, ASSEMBLER_GROUP, &delivery.id)
            .await?;
        Ok(())
    }
}
