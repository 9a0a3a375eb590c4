//! Worker pool: blurs tile jobs and publishes results.
//!
//! A pool runs a fixed number of concurrent worker loops sharing one
//! consumer group on the job stream, plus one background reclaim loop that
//! sweeps up jobs abandoned by crashed workers. Each worker repeats:
//!
//! 1. read a job (blocking up to a bounded timeout),
//! 2. skip-and-ack malformed jobs,
//! 3. blur on a blocking thread, strip the padding,
//! 4. publish the result, and only then
//! 5. ack the job.
//!
//! The publish-before-ack ordering is the at-least-once guarantee: a crash
//! anywhere before step 5 leaves the job pending, and the reclaim loop (of
//! this or a surviving pool) redelivers it. Nothing is ever lost silently.

use crate::blur::{self, BlurError, Kernel};
use crate::config::{Settings, DEFAULT_RECLAIM_BATCH};
use crate::message::{JobMessage, ResultMessage, JOB_STREAM, RESULT_STREAM, WORKER_GROUP};
use crate::queue::{Delivery, QueueError, WorkQueue};
use crate::tile::ProcessedTile;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive queue failures a worker tolerates before giving up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Pause between retries after a failed read.
const READ_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Worker pool errors. Per-tile failures are contained by leaving the job
/// unacked; these variants are pool-fatal conditions.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The queue stayed unreachable past the retry budget.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The kernel configuration is invalid.
    #[error(transparent)]
    Blur(#[from] BlurError),

    /// A blur task died.
    #[error("internal task failure: {0}")]
    Internal(String),
}

/// A fixed-size pool of concurrent tile-blur workers.
pub struct WorkerPool<Q> {
    queue: Q,
    settings: Settings,
    kernel: Arc<Kernel>,
    /// Prefix for consumer names, so pools on different hosts stay
    /// distinguishable in the pending ledger.
    instance: String,
}

impl<Q: WorkQueue> WorkerPool<Q> {
    /// Creates a pool; fails if the configured kernel size is invalid.
    pub fn new(queue: Q, settings: Settings) -> Result<Self, WorkerError> {
        let kernel = Arc::new(Kernel::gaussian(settings.kernel_size)?);
        let instance = std::env::var("HOSTNAME").unwrap_or_else(|_| String::from("pool"));
        Ok(Self {
            queue,
            settings,
            kernel,
            instance,
        })
    }

    /// Overrides the consumer-name prefix.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    /// Runs the pool until the token is cancelled.
    ///
    /// Cancellation is graceful: workers stop reading new jobs but finish
    /// their in-flight blur/publish/ack sequence first.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        self.queue.ensure_group(JOB_STREAM, WORKER_GROUP).await?;

        let mut tasks: JoinSet<Result<(), WorkerError>> = JoinSet::new();
        for i in 0..self.settings.worker_count {
            let consumer = format!("{}-worker-{}", self.instance, i);
            tasks.spawn(worker_loop(
                self.queue.clone(),
                Arc::clone(&self.kernel),
                self.settings.clone(),
                consumer,
                shutdown.clone(),
            ));
        }
        tasks.spawn(reclaim_loop(
            self.queue.clone(),
            Arc::clone(&self.kernel),
            self.settings.clone(),
            format!("{}-reclaimer", self.instance),
            shutdown.clone(),
        ));

        info!(workers = self.settings.worker_count, "worker pool started");

        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| WorkerError::Internal(e.to_string()))??;
        }

        info!("worker pool stopped");
        Ok(())
    }
}

/// One worker: read, blur, publish, ack, repeat until cancelled.
async fn worker_loop<Q: WorkQueue>(
    queue: Q,
    kernel: Arc<Kernel>,
    settings: Settings,
    consumer: String,
    shutdown: CancellationToken,
) -> Result<(), WorkerError> {
    debug!(consumer, "worker started");
    let mut consecutive_errors = 0u32;

    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            read = queue.read(JOB_STREAM, WORKER_GROUP, &consumer, settings.block_timeout) => read,
        };

        match read {
            Ok(Some(delivery)) => {
                consecutive_errors = 0;
                process_job(&queue, &kernel, &consumer, delivery).await?;
            }
            Ok(None) => {
                consecutive_errors = 0;
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    return Err(e.into());
                }
                warn!(consumer, error = %e, "job read failed, retrying");
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
        }
    }

    debug!(consumer, "worker stopped");
    Ok(())
}

/// Periodically re-claims jobs idle past the visibility timeout and
/// processes them in place, so work abandoned by a crashed worker is
/// finished by a survivor without manual intervention.
async fn reclaim_loop<Q: WorkQueue>(
    queue: Q,
    kernel: Arc<Kernel>,
    settings: Settings,
    consumer: String,
    shutdown: CancellationToken,
) -> Result<(), WorkerError> {
    let mut interval = tokio::time::interval(settings.reclaim_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let reclaimed = queue
            .reclaim_stale(
                JOB_STREAM,
                WORKER_GROUP,
                &consumer,
                settings.visibility_timeout,
                DEFAULT_RECLAIM_BATCH,
            )
            .await;

        match reclaimed {
            Ok(deliveries) => {
                if !deliveries.is_empty() {
                    info!(count = deliveries.len(), "reclaimed stale jobs");
                }
                for delivery in deliveries {
                    process_job(&queue, &kernel, &consumer, delivery).await?;
                }
            }
            Err(e) => warn!(error = %e, "reclaim sweep failed"),
        }
    }

    Ok(())
}

/// Processes one claimed job delivery end to end.
///
/// Malformed jobs are logged, acked, and skipped so they cannot poison the
/// stream. A failed result publish leaves the job unacked for redelivery.
async fn process_job<Q: WorkQueue>(
    queue: &Q,
    kernel: &Arc<Kernel>,
    consumer: &str,
    delivery: Delivery,
) -> Result<(), WorkerError> {
    let tile = match JobMessage::decode(&delivery.payload).and_then(JobMessage::into_tile) {
        Ok(tile) => tile,
        Err(e) => {
            warn!(
                consumer,
                message_id = %delivery.id,
                error = %e,
                "malformed job, acknowledging and skipping"
            );
            queue.ack(JOB_STREAM, WORKER_GROUP, &delivery.id).await?;
            return Ok(());
        }
    };

    let started = Instant::now();
    let blur_kernel = Arc::clone(kernel);
    let processed = tokio::task::spawn_blocking(move || {
        let blurred = blur::blur_image(&tile.data, &blur_kernel);
        let center = blur::extract_center(&blurred, tile.padding, tile.width, tile.height);
        ProcessedTile {
            image_id: tile.image_id,
            tile_id: tile.tile_id,
            x: tile.x,
            y: tile.y,
            width: tile.width,
            height: tile.height,
            data: center,
        }
    })
    .await
    .map_err(|e| WorkerError::Internal(format!("blur task failed: {e}")))?;

    let processing_ms = started.elapsed().as_millis() as u64;
    let payload = ResultMessage::from_processed(&processed, consumer, processing_ms)
        .encode()
        .map_err(|e| WorkerError::Internal(e.to_string()))?;

    match queue.publish(RESULT_STREAM, payload).await {
        Ok(_) => {
            // Result is durable; only now is the job safe to ack.
            queue.ack(JOB_STREAM, WORKER_GROUP, &delivery.id).await?;
            debug!(
                consumer,
                image_id = processed.image_id,
                tile_id = processed.tile_id,
                processing_ms,
                "tile processed"
            );
        }
        Err(e) => {
            // Leave the job pending: it will be reclaimed and retried.
            warn!(
                consumer,
                message_id = %delivery.id,
                error = %e,
                "result publish failed, leaving job for redelivery"
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ASSEMBLER_GROUP;
    use crate::queue::MemoryQueue;
    use crate::tile::Tile;
    use image::{Rgba, RgbaImage};

    fn job_payload(image_id: u32, tile_id: u32) -> Vec<u8> {
        let tile = Tile {
            image_id,
            tile_id,
            x: 0,
            y: 0,
            width: 8,
            height: 8,
            padding: 1,
            data: RgbaImage::from_pixel(10, 10, Rgba([50, 100, 150, 255])),
        };
        JobMessage::from_tile(&tile).encode().unwrap()
    }

    async fn queue_with_groups() -> MemoryQueue {
        let queue = MemoryQueue::new();
        queue.ensure_group(JOB_STREAM, WORKER_GROUP).await.unwrap();
        queue
            .ensure_group(RESULT_STREAM, ASSEMBLER_GROUP)
            .await
            .unwrap();
        queue
    }

    fn small_settings() -> Settings {
        Settings::default()
            .with_kernel_size(3)
            .with_worker_count(2)
            .with_block_timeout(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_process_job_publishes_result_then_acks() {
        let queue = queue_with_groups().await;
        queue
            .publish(JOB_STREAM, job_payload(0, 0))
            .await
            .unwrap();
        let delivery = queue
            .read(JOB_STREAM, WORKER_GROUP, "w1", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();

        let kernel = Arc::new(Kernel::gaussian(3).unwrap());
        process_job(&queue, &kernel, "w1", delivery).await.unwrap();

        assert_eq!(queue.stream_len(RESULT_STREAM).await, 1);
        assert_eq!(queue.pending_count(JOB_STREAM, WORKER_GROUP).await, 0);

        let result = queue
            .read(
                RESULT_STREAM,
                ASSEMBLER_GROUP,
                "asm",
                Duration::from_millis(20),
            )
            .await
            .unwrap()
            .unwrap();
        let message = ResultMessage::decode(&result.payload).unwrap();
        assert_eq!(message.worker_id, "w1");
        let processed = message.into_processed().unwrap();
        assert_eq!((processed.width, processed.height), (8, 8));
    }

    #[tokio::test]
    async fn test_malformed_job_is_acked_and_skipped() {
        let queue = queue_with_groups().await;
        queue
            .publish(JOB_STREAM, b"definitely not json".to_vec())
            .await
            .unwrap();
        let delivery = queue
            .read(JOB_STREAM, WORKER_GROUP, "w1", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();

        let kernel = Arc::new(Kernel::gaussian(3).unwrap());
        process_job(&queue, &kernel, "w1", delivery).await.unwrap();

        // No result was produced, but the poison message is gone.
        assert_eq!(queue.stream_len(RESULT_STREAM).await, 0);
        assert_eq!(queue.pending_count(JOB_STREAM, WORKER_GROUP).await, 0);
    }

    #[tokio::test]
    async fn test_pool_drains_jobs_until_cancelled() {
        let queue = queue_with_groups().await;
        for tile_id in 0..5 {
            queue
                .publish(JOB_STREAM, job_payload(0, tile_id))
                .await
                .unwrap();
        }

        let pool = WorkerPool::new(queue.clone(), small_settings())
            .unwrap()
            .with_instance("test");
        let shutdown = CancellationToken::new();
        let runner = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(shutdown).await })
        };

        // Wait until every job has been blurred and published.
        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.stream_len(RESULT_STREAM).await < 5 {
            assert!(Instant::now() < deadline, "pool did not drain jobs in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(queue.pending_count(JOB_STREAM, WORKER_GROUP).await, 0);
    }

    #[tokio::test]
    async fn test_reclaim_loop_finishes_abandoned_job() {
        let queue = queue_with_groups().await;
        queue
            .publish(JOB_STREAM, job_payload(2, 3))
            .await
            .unwrap();

        // A "crashed" worker claims the job and never acks it.
        queue
            .read(JOB_STREAM, WORKER_GROUP, "crashed", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();

        let settings = small_settings()
            .with_visibility_timeout(Duration::from_millis(30))
            .with_reclaim_interval(Duration::from_millis(20));
        let pool = WorkerPool::new(queue.clone(), settings)
            .unwrap()
            .with_instance("survivor");
        let shutdown = CancellationToken::new();
        let runner = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(shutdown).await })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.stream_len(RESULT_STREAM).await < 1 {
            assert!(
                Instant::now() < deadline,
                "abandoned job was never reclaimed"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(queue.pending_count(JOB_STREAM, WORKER_GROUP).await, 0);
    }
}
