//! Tileblur CLI - command-line interface
//!
//! One subcommand per deployment role: `coordinator`, `worker`, and
//! `assembler` run a single distributed role against a Redis backend,
//! while `local` and `sequential` run entirely in-process.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tileblur::assembler::Assembler;
use tileblur::config::Settings;
use tileblur::coordinator::Coordinator;
use tileblur::local::{run_pipeline, run_sequential};
use tileblur::logging::{default_log_dir, default_log_file, init_logging};
use tileblur::queue::RedisQueue;
use tileblur::store::RedisStore;
use tileblur::worker::WorkerPool;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "tileblur")]
#[command(version = tileblur::VERSION)]
#[command(about = "Blur image batches through a fault-tolerant tile pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct IoArgs {
    /// Input directory scanned for images
    #[arg(long, default_value = "input")]
    input: PathBuf,

    /// Output directory for blurred images
    #[arg(long, default_value = "output")]
    output: PathBuf,
}

#[derive(Args)]
struct BlurArgs {
    /// Gaussian kernel size (odd)
    #[arg(long, default_value = "15")]
    kernel: u32,

    /// Tile edge length in pixels
    #[arg(long, default_value = "256")]
    tile_edge: u32,
}

#[derive(Args)]
struct QueueArgs {
    /// Redis server address
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    redis: String,

    /// Run identifier; namespaces streams and metadata keys
    #[arg(long, default_value = "tileblur")]
    run_id: String,
}

#[derive(Subcommand)]
enum Command {
    /// Partition input images and publish tile jobs
    Coordinator {
        #[command(flatten)]
        io: IoArgs,
        #[command(flatten)]
        blur: BlurArgs,
        #[command(flatten)]
        queue: QueueArgs,
    },
    /// Run a pool of tile-blur workers until interrupted
    Worker {
        #[command(flatten)]
        blur: BlurArgs,
        #[command(flatten)]
        queue: QueueArgs,

        /// Concurrent workers in this pool
        #[arg(long, default_value = "10")]
        workers: usize,
    },
    /// Reassemble blurred tiles into output images until interrupted
    Assembler {
        #[command(flatten)]
        queue: QueueArgs,
    },
    /// Run the whole pipeline in one process (in-memory queue)
    Local {
        #[command(flatten)]
        io: IoArgs,
        #[command(flatten)]
        blur: BlurArgs,

        /// Concurrent workers
        #[arg(long, default_value = "10")]
        workers: usize,
    },
    /// Blur images one at a time without the tile pipeline
    Sequential {
        #[command(flatten)]
        io: IoArgs,

        /// Gaussian kernel size (odd)
        #[arg(long, default_value = "15")]
        kernel: u32,
    },
}

/// Cancels the returned token on Ctrl-C so role loops can shut down
/// gracefully: no new reads, in-flight work completes.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_token.cancel();
        }
    });
    token
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    process::exit(1);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _logging = match init_logging(default_log_dir(), default_log_file()) {
        Ok(guard) => guard,
        Err(e) => fail(format!("failed to initialize logging: {e}")),
    };

    match cli.command {
        Command::Coordinator { io, blur, queue } => {
            let settings = Settings::default()
                .with_input_dir(io.input)
                .with_output_dir(io.output)
                .with_kernel_size(blur.kernel)
                .with_tile_edge(blur.tile_edge)
                .with_queue_addr(queue.redis.clone())
                .with_run_id(queue.run_id.clone());
            if let Err(e) = settings.validate() {
                fail(e);
            }

            let work_queue = match RedisQueue::connect(&queue.redis, &queue.run_id).await {
                Ok(q) => q,
                Err(e) => fail(e),
            };
            let store = match RedisStore::connect(&queue.redis, &queue.run_id).await {
                Ok(s) => s,
                Err(e) => fail(e),
            };

            let coordinator = Coordinator::new(work_queue, store, settings);
            match coordinator.run().await {
                Ok(infos) => {
                    println!("Published tile jobs for {} images", infos.len());
                }
                Err(e) => fail(e),
            }
        }

        Command::Worker {
            blur,
            queue,
            workers,
        } => {
            let settings = Settings::default()
                .with_kernel_size(blur.kernel)
                .with_tile_edge(blur.tile_edge)
                .with_worker_count(workers)
                .with_queue_addr(queue.redis.clone())
                .with_run_id(queue.run_id.clone());
            if let Err(e) = settings.validate() {
                fail(e);
            }

            let work_queue = match RedisQueue::connect(&queue.redis, &queue.run_id).await {
                Ok(q) => q,
                Err(e) => fail(e),
            };

            let pool = match WorkerPool::new(work_queue, settings) {
                Ok(pool) => pool,
                Err(e) => fail(e),
            };
            if let Err(e) = pool.run(shutdown_on_ctrl_c()).await {
                fail(e);
            }
        }

        Command::Assembler { queue } => {
            let settings = Settings::default()
                .with_queue_addr(queue.redis.clone())
                .with_run_id(queue.run_id.clone());

            let work_queue = match RedisQueue::connect(&queue.redis, &queue.run_id).await {
                Ok(q) => q,
                Err(e) => fail(e),
            };
            let store = match RedisStore::connect(&queue.redis, &queue.run_id).await {
                Ok(s) => s,
                Err(e) => fail(e),
            };

            let assembler = Assembler::new(work_queue, store, settings);
            if let Err(e) = assembler.run(shutdown_on_ctrl_c()).await {
                fail(e);
            }
        }

        Command::Local { io, blur, workers } => {
            let settings = Settings::default()
                .with_input_dir(io.input)
                .with_output_dir(io.output)
                .with_kernel_size(blur.kernel)
                .with_tile_edge(blur.tile_edge)
                .with_worker_count(workers);
            match run_pipeline(&settings).await {
                Ok(summary) => {
                    println!(
                        "Blurred {} of {} images",
                        summary.images_completed, summary.images_discovered
                    );
                }
                Err(e) => fail(e),
            }
        }

        Command::Sequential { io, kernel } => {
            let settings = Settings::default()
                .with_input_dir(io.input)
                .with_output_dir(io.output)
                .with_kernel_size(kernel);
            match run_sequential(&settings).await {
                Ok(summary) => {
                    println!(
                        "Blurred {} of {} images",
                        summary.images_completed, summary.images_discovered
                    );
                }
                Err(e) => fail(e),
            }
        }
    }
}
