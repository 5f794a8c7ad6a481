mod classify;
mod mux;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use engine::{Engine, EngineConfig};
use tracing::{error, info, warn};
use video_ingest::SourceConfig;

use crate::classify::DiffClassifier;
use crate::mux::RawSegmentEncoder;

/// Motion-gated continuous recording daemon.
#[derive(Debug, Parser)]
#[command(name = "watcher")]
struct Cli {
    /// Frame source: `pattern` for the synthetic generator, or a path to a
    /// headerless planar YUV420 file.
    #[arg(long, default_value = "pattern")]
    source: String,

    /// Directory receiving session files.
    #[arg(long, default_value = "recordings")]
    output: PathBuf,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Source frame rate.
    #[arg(long, default_value_t = 20)]
    fps: u32,

    /// Number of classifier worker threads.
    #[arg(long, default_value_t = 3)]
    workers: usize,

    /// Detection window capacity in frames.
    #[arg(long, default_value_t = 20)]
    window: usize,

    /// Motion propagation tolerance in milliseconds.
    #[arg(long, default_value_t = 150)]
    tolerance_ms: u32,

    /// Idle gap that splits the recording into a new file, in seconds.
    #[arg(long, default_value_t = 10)]
    split_gap_secs: u32,

    /// Stop after this many seconds instead of running until Ctrl+C.
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Emit verbose logging (frame drops, classification detail).
    #[arg(long)]
    verbose: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose);
    let prometheus = telemetry::init_metrics_recorder();

    if cli.workers == 0 {
        bail!("--workers must be at least 1");
    }
    if cli.width % 2 != 0 || cli.height % 2 != 0 {
        bail!("--width and --height must be even for planar YUV420");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .context("failed to install Ctrl+C handler")?;
    }

    let config = EngineConfig {
        width: cli.width,
        height: cli.height,
        output_dir: cli.output.clone(),
        window_capacity: cli.window,
        propagation_tolerance_ns: cli.tolerance_ms as i64 * 1_000_000,
        session_split_gap_ns: cli.split_gap_secs as i64 * 1_000_000_000,
        detector_workers: cli.workers,
        ..EngineConfig::default()
    };
    let engine = Engine::new(
        config,
        Arc::new(DiffClassifier::default()),
        Box::new(RawSegmentEncoder::default()),
    )
    .context("failed to build the recording engine")?;

    let source_config = SourceConfig { width: cli.width, height: cli.height, fps: cli.fps };
    let frames = if cli.source == "pattern" {
        video_ingest::spawn_pattern_source(source_config).context("failed to start pattern source")?
    } else {
        video_ingest::spawn_file_source(cli.source.as_ref(), source_config)
            .with_context(|| format!("failed to start file source {:?}", cli.source))?
    };

    info!("recording into {}", cli.output.display());
    engine.start_recording();

    let deadline = cli.duration_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("shutdown requested");
            break;
        }
        if deadline.is_some_and(|at| Instant::now() >= at) {
            info!("configured duration elapsed");
            break;
        }

        match frames.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(frame)) => engine.ingest(frame),
            Ok(Err(err)) => {
                error!("capture error: {err}");
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("frame source ended");
                break;
            }
        }
    }

    engine.stop_recording();
    let stats = engine.stats();
    engine.shutdown();

    info!(
        "done: {} frame(s) ingested, {} kept, {} session split(s)",
        stats.ingested, stats.kept, stats.session_splits
    );
    if cli.verbose {
        print!("{}", prometheus.render());
    }
    Ok(())
}
