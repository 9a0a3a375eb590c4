//! Integration tests for the complete tile pipeline.
//!
//! These tests run the coordinator, worker pool, and assembler together
//! over the in-memory transport and verify the system-level guarantees:
//! - the tiling grid publishes exactly the expected job count,
//! - an identity kernel reproduces inputs exactly,
//! - outputs are written only when every tile has been received,
//! - duplicate deliveries do not change the output, and
//! - crashed workers (read without ack) delay but never corrupt a run.

use image::{Rgba, RgbaImage};
use std::path::Path;
use std::time::{Duration, Instant};
use tileblur::assembler::Assembler;
use tileblur::config::Settings;
use tileblur::coordinator::Coordinator;
use tileblur::message::{
    ResultMessage, ASSEMBLER_GROUP, JOB_STREAM, RESULT_STREAM, WORKER_GROUP,
};
use tileblur::queue::{MemoryQueue, WorkQueue};
use tileblur::raster;
use tileblur::store::{ImageInfo, MemoryStore, MetadataStore};
use tileblur::tile::ProcessedTile;
use tileblur::worker::WorkerPool;
use tokio_util::sync::CancellationToken;

const WAIT_BUDGET: Duration = Duration::from_secs(60);

/// Deterministic non-uniform test image.
fn test_image(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        Rgba([
            (x % 256) as u8,
            (y % 256) as u8,
            ((x + y) % 256) as u8,
            255,
        ])
    })
}

fn fast_settings(root: &Path) -> Settings {
    Settings::default()
        .with_input_dir(root.join("in"))
        .with_output_dir(root.join("out"))
        .with_block_timeout(Duration::from_millis(20))
        .with_visibility_timeout(Duration::from_millis(60))
        .with_reclaim_interval(Duration::from_millis(40))
}

fn write_input(settings: &Settings, name: &str, image: &RgbaImage) {
    std::fs::create_dir_all(&settings.input_dir).unwrap();
    raster::save_image(image, &settings.input_dir.join(name)).unwrap();
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT_BUDGET;
    while !condition().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Runs all three roles until every published image completes, then
/// returns the image records.
async fn run_to_completion(
    settings: &Settings,
    queue: &MemoryQueue,
    store: &MemoryStore,
) -> Vec<ImageInfo> {
    let shutdown = CancellationToken::new();

    let pool = WorkerPool::new(queue.clone(), settings.clone())
        .unwrap()
        .with_instance("it");
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
    let infos = coordinator.run().await.unwrap();

    for info in &infos {
        let store = store.clone();
        let id = info.id;
        wait_until("image completion", move || {
            let store = store.clone();
            async move { store.completed_at(id).await.unwrap().is_some() }
        })
        .await;
    }

    shutdown.cancel();
    workers.await.unwrap().unwrap();
    assembly.await.unwrap().unwrap();
    infos
}

#[tokio::test]
async fn test_600x400_image_produces_exactly_six_tiles() {
    let dir = tempfile::tempdir().unwrap();
    // Generous visibility timeout: a debug-build blur of a 256px tile can
    // outlast a short one, and a spurious reclaim would duplicate results.
    let settings = fast_settings(dir.path())
        .with_kernel_size(15)
        .with_tile_edge(256)
        .with_worker_count(4)
        .with_visibility_timeout(Duration::from_secs(30));
    write_input(&settings, "photo.png", &test_image(600, 400));

    let queue = MemoryQueue::new();
    let store = MemoryStore::new();
    let infos = run_to_completion(&settings, &queue, &store).await;

    // ceil(600/256) = 3 columns, ceil(400/256) = 2 rows.
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].expected_tiles, 6);
    assert_eq!(queue.stream_len(JOB_STREAM).await, 6, "6 distinct jobs");
    assert_eq!(
        queue.stream_len(RESULT_STREAM).await,
        6,
        "6 distinct results"
    );
    assert_eq!(store.received_count(0).await.unwrap(), 6);

    let output = raster::load_image(&infos[0].output_path).unwrap();
    assert_eq!((output.width(), output.height()), (600, 400));

    // Everything acknowledged: nothing left pending on either stream.
    assert_eq!(queue.pending_count(JOB_STREAM, WORKER_GROUP).await, 0);
    assert_eq!(queue.pending_count(RESULT_STREAM, ASSEMBLER_GROUP).await, 0);
}

#[tokio::test]
async fn test_identity_kernel_round_trips_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let settings = fast_settings(dir.path())
        .with_kernel_size(1)
        .with_tile_edge(32)
        .with_worker_count(3);
    let original = test_image(100, 70);
    write_input(&settings, "photo.png", &original);

    let queue = MemoryQueue::new();
    let store = MemoryStore::new();
    let infos = run_to_completion(&settings, &queue, &store).await;

    let output = raster::load_image(&infos[0].output_path).unwrap();
    assert_eq!(output, original, "1x1 kernel must reproduce the input");
}

#[tokio::test]
async fn test_output_written_only_after_every_tile_received() {
    let dir = tempfile::tempdir().unwrap();
    let output_path = dir.path().join("img.png");
    let settings = fast_settings(dir.path());

    let queue = MemoryQueue::new();
    let store = MemoryStore::new();
    queue
        .ensure_group(RESULT_STREAM, ASSEMBLER_GROUP)
        .await
        .unwrap();

    // One 8x8 image of four 4x4 tiles, results injected by hand.
    store
        .put_image_info(&ImageInfo {
            id: 0,
            input_path: dir.path().join("in.png"),
            output_path: output_path.clone(),
            width: 8,
            height: 8,
            expected_tiles: 4,
            start_time: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let publish_tile = |tile_id: u32, x: u32, y: u32| {
        let queue = queue.clone();
        async move {
            let tile = ProcessedTile {
                image_id: 0,
                tile_id,
                x,
                y,
                width: 4,
                height: 4,
                data: RgbaImage::from_pixel(4, 4, Rgba([tile_id as u8, 0, 0, 255])),
            };
            let payload = ResultMessage::from_processed(&tile, "w", 1).encode().unwrap();
            queue.publish(RESULT_STREAM, payload).await.unwrap();
        }
    };

    let assembler = Assembler::new(queue.clone(), store.clone(), settings.clone());
    let shutdown = CancellationToken::new();
    let runner = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { assembler.run(shutdown).await })
    };

    // Three of four tiles: the output must not exist yet.
    publish_tile(0, 0, 0).await;
    publish_tile(1, 4, 0).await;
    publish_tile(2, 0, 4).await;
    {
        let store = store.clone();
        wait_until("three tiles applied", move || {
            let store = store.clone();
            async move { store.received_count(0).await.unwrap() == 3 }
        })
        .await;
    }
    assert!(
        !output_path.exists(),
        "output must never be saved from a strict subset of tiles"
    );
    assert!(store.completed_at(0).await.unwrap().is_none());

    // The last tile completes the image.
    publish_tile(3, 4, 4).await;
    {
        let store = store.clone();
        wait_until("completion", move || {
            let store = store.clone();
            async move { store.completed_at(0).await.unwrap().is_some() }
        })
        .await;
    }
    assert!(output_path.exists());
    assert_eq!(store.received_count(0).await.unwrap(), 4);

    shutdown.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_crashed_workers_delay_but_do_not_corrupt_output() {
    // Reference run: no crash.
    let reference_dir = tempfile::tempdir().unwrap();
    let reference_settings = fast_settings(reference_dir.path())
        .with_kernel_size(5)
        .with_tile_edge(32)
        .with_worker_count(2);
    let original = test_image(120, 80);
    write_input(&reference_settings, "photo.png", &original);

    let queue = MemoryQueue::new();
    let store = MemoryStore::new();
    let infos = run_to_completion(&reference_settings, &queue, &store).await;
    let reference = raster::load_image(&infos[0].output_path).unwrap();

    // Crash run: the coordinator publishes, two workers read jobs and die
    // before publishing results (read without ack), then a fresh pool
    // recovers the abandoned jobs via the reclaim sweep.
    let crash_dir = tempfile::tempdir().unwrap();
    let crash_settings = fast_settings(crash_dir.path())
        .with_kernel_size(5)
        .with_tile_edge(32)
        .with_worker_count(2);
    write_input(&crash_settings, "photo.png", &original);

    let queue = MemoryQueue::new();
    let store = MemoryStore::new();
    let coordinator = Coordinator::new(queue.clone(), store.clone(), crash_settings.clone());
    let infos = coordinator.run().await.unwrap();
    assert_eq!(infos.len(), 1);

    for doomed in ["doomed-0", "doomed-1"] {
        let claimed = queue
            .read(JOB_STREAM, WORKER_GROUP, doomed, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(claimed.is_some(), "crash scenario needs claimed jobs");
    }

    // Restart: surviving workers must finish the whole image.
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(queue.clone(), crash_settings.clone())
        .unwrap()
        .with_instance("survivor");
    let workers = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };
    let assembler = Assembler::new(queue.clone(), store.clone(), crash_settings.clone());
    let assembly = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { assembler.run(shutdown).await })
    };

    {
        let store = store.clone();
        wait_until("crash-run completion", move || {
            let store = store.clone();
            async move { store.completed_at(0).await.unwrap().is_some() }
        })
        .await;
    }
    shutdown.cancel();
    workers.await.unwrap().unwrap();
    assembly.await.unwrap().unwrap();

    let recovered = raster::load_image(&infos[0].output_path).unwrap();
    assert_eq!(
        recovered, reference,
        "output after crash-and-recover must be identical to a clean run"
    );
}

#[tokio::test]
async fn test_duplicate_result_deliveries_do_not_change_output() {
    // Clean run for reference.
    let reference_dir = tempfile::tempdir().unwrap();
    let reference_settings = fast_settings(reference_dir.path())
        .with_kernel_size(3)
        .with_tile_edge(16)
        .with_worker_count(2);
    let original = test_image(40, 40);
    write_input(&reference_settings, "photo.png", &original);

    let queue = MemoryQueue::new();
    let store = MemoryStore::new();
    let infos = run_to_completion(&reference_settings, &queue, &store).await;
    let reference = raster::load_image(&infos[0].output_path).unwrap();

    // Duplicate run: every result is published twice before the assembler
    // starts consuming.
    let dup_dir = tempfile::tempdir().unwrap();
    // Generous visibility timeout so no reclaim fires while the workers
    // run; the duplicates in this test come from the explicit re-publish.
    let dup_settings = fast_settings(dup_dir.path())
        .with_kernel_size(3)
        .with_tile_edge(16)
        .with_worker_count(2)
        .with_visibility_timeout(Duration::from_secs(30));
    write_input(&dup_settings, "photo.png", &original);

    let queue = MemoryQueue::new();
    let store = MemoryStore::new();
    // A probe group created before the workers run sees every result and
    // lets the test copy the payloads back as duplicates.
    queue.ensure_group(RESULT_STREAM, "probe").await.unwrap();

    let coordinator = Coordinator::new(queue.clone(), store.clone(), dup_settings.clone());
    let infos = coordinator.run().await.unwrap();
    let expected = infos[0].expected_tiles as usize;

    // Blur all tiles first.
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(queue.clone(), dup_settings.clone())
        .unwrap()
        .with_instance("dup");
    let workers = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { pool.run(shutdown).await })
    };
    {
        let queue = queue.clone();
        wait_until("all results published", move || {
            let queue = queue.clone();
            async move { queue.stream_len(RESULT_STREAM).await >= expected }
        })
        .await;
    }
    shutdown.cancel();
    workers.await.unwrap().unwrap();

    // Re-publish every result once more: the assembler group (created by
    // the coordinator before any result existed) now sees each tile twice.
    let mut duplicates = Vec::new();
    while let Some(delivery) = queue
        .read(RESULT_STREAM, "probe", "p", Duration::from_millis(20))
        .await
        .unwrap()
    {
        duplicates.push(delivery.payload);
    }
    assert_eq!(duplicates.len(), expected);
    for payload in duplicates {
        queue.publish(RESULT_STREAM, payload).await.unwrap();
    }

    let assembler = Assembler::new(queue.clone(), store.clone(), dup_settings.clone());
    let shutdown = CancellationToken::new();
    let assembly = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { assembler.run(shutdown).await })
    };
    {
        let store = store.clone();
        wait_until("duplicate-run completion", move || {
            let store = store.clone();
            async move { store.completed_at(0).await.unwrap().is_some() }
        })
        .await;
    }
    shutdown.cancel();
    assembly.await.unwrap().unwrap();

    assert_eq!(store.received_count(0).await.unwrap() as usize, expected);
    let duplicated = raster::load_image(&infos[0].output_path).unwrap();
    assert_eq!(duplicated, reference);
}
