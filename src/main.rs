//! Accelerator Pipeline Benchmark
//!
//! Runs frames through the asynchronous inference engine on the simulated
//! accelerator and reports throughput.

use anyhow::Result;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use accelpipe::bench::Benchmark;
use accelpipe::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("Starting accelerator pipeline benchmark v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load(Config::default_path()).unwrap_or_else(|e| {
        info!("Using default config ({})", e);
        Config::default()
    });

    info!("Configuration loaded:");
    info!("  Model: {}", config.bench.model_path.display());
    info!("  Frames: {}", config.bench.frames);
    info!("  Queue capacity: {}", config.engine.queue_capacity);
    info!("  Guard policy: {:?}", config.engine.guard_policy);
    info!(
        "  Device: {} workers, {} in flight, {}ms latency",
        config.device.workers, config.device.max_in_flight, config.device.latency_ms
    );

    let bench = Benchmark::new(&config)?;

    // Stop submitting and release waiters on Ctrl-C
    let stop = bench.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping...");
            stop.stop();
        }
    });

    let report = bench.run().await?;
    info!(
        "Throughput: {:.1} FPS over {} frames",
        report.fps(),
        report.frames_completed
    );

    info!("Goodbye!");
    Ok(())
}
