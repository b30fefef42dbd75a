//! Headless driver: registers point clouds and streams them into sparse buffers
//! one upload per frame, logging progress.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use point_stream::config::DEFAULT_MAX_POINTS;
use point_stream::sparse::{GpuContext, DEFAULT_PAGE_SIZE};
use point_stream::{DrainOutcome, HostAllocator, PointStreamer, SparseBuffer, StreamConfig, WgpuAllocator};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Adapter {
    /// Page-committed buffers in system memory.
    Host,
    /// Segmented storage buffers on the first high-performance GPU.
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(name = "point_stream", version, about, long_about = None)]
struct Args {
    /// LAS files or directories to search for them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Capacity of the global point index space.
    #[arg(long, env = "POINT_STREAM_MAX_POINTS", default_value_t = DEFAULT_MAX_POINTS)]
    max_points: u64,

    /// Encoder threads. Derived from the core count when omitted.
    #[arg(long, env = "POINT_STREAM_THREADS")]
    threads: Option<usize>,

    #[arg(long, value_enum, env = "POINT_STREAM_ADAPTER", default_value_t = Adapter::Host)]
    adapter: Adapter,

    /// Commit granularity in bytes (host page or GPU segment).
    #[arg(long, env = "POINT_STREAM_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u64,

    /// Target frame time; one upload is drained per frame.
    #[arg(long, env = "POINT_STREAM_FRAME_MS", default_value_t = 16)]
    frame_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::debug!("{:?}", args);

    let config = StreamConfig {
        max_points: args.max_points,
        worker_threads: args.threads,
        ..Default::default()
    };

    match args.adapter {
        Adapter::Host => {
            let allocator = HostAllocator {
                page_size: args.page_size,
            };
            run(PointStreamer::new(config, &allocator)?, &args)
        }
        Adapter::Wgpu => {
            let gpu = GpuContext::new_headless_blocking().context("creating headless GPU device")?;
            let allocator = WgpuAllocator::new(gpu, args.page_size)?;
            log::info!("GPU segment size {} bytes", allocator.segment_size());
            run(PointStreamer::new(config, &allocator)?, &args)
        }
    }
}

fn run<B: SparseBuffer>(mut streamer: PointStreamer<B>, args: &Args) -> Result<()> {
    let (dirs, files): (Vec<_>, Vec<_>) = args.inputs.iter().cloned().partition(|p| p.is_dir());

    if !files.is_empty() {
        streamer.register_files(&files).context("registering files")?;
    }
    for dir in &dirs {
        streamer
            .register_directory(dir)
            .with_context(|| format!("registering {}", dir.display()))?;
    }

    let bounds = streamer.session_bounds();
    log::info!(
        "{} sources, {} points in {} batches; center {:?}, extent {:?}",
        streamer.sources().len(),
        streamer.num_points(),
        streamer.num_batches(),
        bounds.center(),
        bounds.size()
    );

    let frame = Duration::from_millis(args.frame_ms);
    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut rejected = 0usize;

    loop {
        let frame_start = Instant::now();

        match streamer.drain_one_upload() {
            Ok(DrainOutcome::Idle) if streamer.is_idle() => break,
            Ok(_) => {}
            Err(err) => {
                log::error!("upload failed: {}", err);
                rejected += 1;
            }
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            log::info!(
                "{}/{} points, {} batches, {:.1} MiB committed",
                streamer.num_points_loaded(),
                streamer.num_points(),
                streamer.num_batches_loaded(),
                streamer.buffers().committed_bytes() as f64 / (1024.0 * 1024.0)
            );
            last_report = Instant::now();
        }

        if let Some(rest) = frame.checked_sub(frame_start.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    let failures = streamer.take_failures();
    for failure in &failures {
        log::error!(
            "'{}': points {}..{} not loaded: {}",
            failure.source_name,
            failure.first_point,
            failure.first_point + failure.num_points,
            failure.error
        );
    }

    log::info!(
        "loaded {} points ({} batches) in {:.2} s, {:.2} Mpts/s, {:.1} MiB committed",
        streamer.num_points_loaded(),
        streamer.num_batches_loaded(),
        elapsed,
        streamer.num_points_loaded() as f64 / elapsed.max(1e-9) / 1e6,
        streamer.buffers().committed_bytes() as f64 / (1024.0 * 1024.0)
    );

    streamer.shutdown();

    if !failures.is_empty() || rejected > 0 {
        anyhow::bail!("{} tasks failed, {} uploads rejected", failures.len(), rejected);
    }
    Ok(())
}
