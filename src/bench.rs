//! Benchmark Driver
//!
//! Feeds frames through the engine on one blocking task while another drains
//! the result queue, then reports throughput. Buffers are recycled with
//! `clear()` every `clear_every` frames once the engine is idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::{BenchConfig, Config};
use crate::device::SimRuntime;
use crate::engine::{allocate, AsyncInferEngine, BoundedQueue, ResultQueue};

const MAX_RETRIES: usize = 3;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Benchmark outcome
#[derive(Debug, Clone)]
pub struct BenchReport {
    pub frames_submitted: usize,
    pub frames_completed: usize,
    pub retries: usize,
    /// Items that arrived after an item with a higher frame index
    pub out_of_order: usize,
    pub elapsed: Duration,
}

impl BenchReport {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames_completed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Stops a running benchmark from another task
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    queue: Arc<ResultQueue>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.close();
    }
}

/// A configured engine plus the settings of one benchmark run
pub struct Benchmark {
    engine: AsyncInferEngine,
    queue: Arc<ResultQueue>,
    settings: BenchConfig,
    stop: Arc<AtomicBool>,
}

impl Benchmark {
    /// Open the simulated device and initialize the engine from `config`
    pub fn new(config: &Config) -> Result<Self> {
        config.engine.validate().context("Invalid engine configuration")?;

        let queue = Arc::new(BoundedQueue::new(config.engine.queue_capacity));
        let runtime = Arc::new(SimRuntime::new(config.device.clone()));
        let mut engine = AsyncInferEngine::new(runtime, config.engine.clone());

        engine
            .initialize(&config.bench.model_path, queue.clone())
            .with_context(|| format!("Failed to initialize engine with {}", config.bench.model_path.display()))?;

        Ok(Self {
            engine,
            queue,
            settings: config.bench.clone(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: self.stop.clone(),
            queue: self.queue.clone(),
        }
    }

    /// Run the benchmark to completion or until stopped
    pub async fn run(self) -> Result<BenchReport> {
        let Benchmark {
            engine,
            queue,
            settings,
            stop,
        } = self;

        info!(
            "Benchmarking {} frames ({} bytes each)",
            settings.frames,
            engine.input_frame_size()
        );
        let start = Instant::now();

        let outputs_per_item = engine.outputs().len();
        let consumer_queue = queue.clone();
        let consumer = tokio::task::spawn_blocking(move || consume(&consumer_queue, outputs_per_item));

        let producer = tokio::task::spawn_blocking(move || {
            let result = produce(&engine, &settings, &stop);
            if !engine.wait_idle(IDLE_TIMEOUT) {
                warn!("{} jobs still in flight at shutdown", engine.in_flight());
            }
            engine.clear();
            queue.close();
            result
        });

        let (frames_submitted, retries) = producer.await??;
        let (frames_completed, out_of_order) = consumer.await?;

        let report = BenchReport {
            frames_submitted,
            frames_completed,
            retries,
            out_of_order,
            elapsed: start.elapsed(),
        };
        info!(
            "Completed {}/{} frames in {:?} ({:.1} FPS, {} retries, {} out of order)",
            report.frames_completed,
            report.frames_submitted,
            report.elapsed,
            report.fps(),
            report.retries,
            report.out_of_order
        );
        Ok(report)
    }
}

/// Submit frames; returns (frames submitted, retries)
fn produce(engine: &AsyncInferEngine, settings: &BenchConfig, stop: &AtomicBool) -> Result<(usize, usize)> {
    let frame_size = engine.input_frame_size();
    let mut submitted = 0;
    let mut retries = 0;

    for frame_index in 0..settings.frames {
        if stop.load(Ordering::SeqCst) {
            info!("Benchmark stopped after {} frames", submitted);
            break;
        }

        let input = allocate(frame_size)?;
        input.write(|bytes| bytes.fill(frame_index as u8));

        let mut attempts = 0;
        loop {
            match engine.infer(&input, frame_index) {
                Ok(()) => break,
                Err(e) if e.is_recoverable() && attempts < MAX_RETRIES => {
                    attempts += 1;
                    retries += 1;
                    warn!("Retrying frame {} ({}/{}): {}", frame_index, attempts, MAX_RETRIES, e);
                }
                Err(e) => return Err(e).with_context(|| format!("Frame {} failed", frame_index)),
            }
        }
        submitted += 1;

        if settings.clear_every > 0 && submitted % settings.clear_every == 0 {
            if !engine.wait_idle(IDLE_TIMEOUT) {
                warn!("Engine not idle before clear at frame {}", frame_index);
            }
            engine.clear();
            debug!("Recycled buffers after frame {}", frame_index);
        }
    }

    Ok((submitted, retries))
}

/// Drain the result queue; returns (items received, out-of-order arrivals)
fn consume(queue: &ResultQueue, outputs_per_item: usize) -> (usize, usize) {
    let mut completed = 0;
    let mut out_of_order = 0;
    let mut highest = None;

    for item in queue.drain_blocking() {
        if item.outputs.len() != outputs_per_item {
            warn!(
                "Frame {} has {} outputs, expected {}",
                item.frame_index,
                item.outputs.len(),
                outputs_per_item
            );
        }
        match highest {
            Some(h) if item.frame_index < h => out_of_order += 1,
            _ => highest = Some(item.frame_index),
        }
        completed += 1;
    }

    (completed, out_of_order)
}
