//! Single-process pipeline over the in-memory transport.

use super::{LocalError, RunSummary};
use crate::assembler::Assembler;
use crate::config::Settings;
use crate::coordinator::Coordinator;
use crate::queue::MemoryQueue;
use crate::stats::{self, ImageOutcome};
use crate::store::{MemoryStore, MetadataStore};
use crate::worker::WorkerPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Poll interval while waiting for image completions.
const COMPLETION_POLL: Duration = Duration::from_millis(25);

/// Runs coordinator, worker pool, and assembler in one process over the
/// in-memory queue and store.
///
/// Identical semantics to the distributed deployment — only the transport
/// differs. Returns once every published image has been assembled and
/// saved; the queue's redelivery guarantees make that wait safe.
pub async fn run_pipeline(settings: &Settings) -> Result<RunSummary, LocalError> {
    settings.validate()?;

    let queue = MemoryQueue::new();
    let store = MemoryStore::new();
    let shutdown = CancellationToken::new();

    let pool = WorkerPool::new(queue.clone(), settings.clone())?.with_instance("local");
    let workers = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };

    let assembler = Assembler::new(queue.clone(), store.clone(), settings.clone());
    let assembly = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { assembler.run(shutdown).await })
    };

    let coordinator = Coordinator::new(queue.clone(), store.clone(), settings.clone());
    let infos = coordinator.run().await?;
    let discovered = crate::raster::discover_images(&settings.input_dir)?.len();

    // Wait for the assembler to finish every published image. Tiles can
    // be redelivered but never lost, so each image completes eventually.
    let waits = infos.iter().map(|info| {
        let store = store.clone();
        let image_id = info.id;
        async move {
            while store.completed_at(image_id).await?.is_none() {
                tokio::time::sleep(COMPLETION_POLL).await;
            }
            Ok::<_, crate::store::StoreError>(())
        }
    });
    for result in futures::future::join_all(waits).await {
        result?;
    }

    // Stamp the run and log the summary before tearing down.
    if let Some(mut timings) = store.timings().await? {
        timings.finish();
        store.put_timings(&timings).await?;

        let mut outcomes = Vec::with_capacity(infos.len());
        for info in &infos {
            outcomes.push(ImageOutcome {
                image_id: info.id,
                output_path: info.output_path.clone(),
                tiles: info.expected_tiles,
                started: info.start_time,
                completed: store.completed_at(info.id).await?,
            });
        }
        stats::log_summary(&timings, &outcomes);
    }

    shutdown.cancel();
    workers
        .await
        .map_err(|e| LocalError::Internal(e.to_string()))??;
    assembly
        .await
        .map_err(|e| LocalError::Internal(e.to_string()))??;

    info!(images = infos.len(), "local pipeline finished");
    Ok(RunSummary {
        images_completed: infos.len(),
        images_discovered: discovered,
        outputs: infos.into_iter().map(|i| i.output_path).collect(),
    })
}
