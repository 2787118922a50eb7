//! Simulated Accelerator
//!
//! A software device that behaves like an asynchronous accelerator: jobs are
//! accepted into a bounded in-flight window, executed on device-owned worker
//! threads, and reported through completion callbacks on those threads.
//!
//! Models are described by TOML files:
//!
//! ```toml
//! name = "resnet_v1_50"
//!
//! [[inputs]]
//! name = "input_layer1"
//! shape = [224, 224, 3]
//! format = "uint8"
//!
//! [[outputs]]
//! name = "fc1000"
//! shape = [1000]
//! ```
//!
//! Execution echoes the first input cyclically into every output.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use tracing::{debug, error, info};

use super::traits::{
    CompletionCallback, CompletionInfo, ConfiguredModel, Device, FormatType, InferModel, Job,
    JobCompleter, JobStatus, Runtime, StreamInfo,
};
use crate::config::DeviceConfig;
use crate::engine::binding::{Bindings, BoundBuffers};
use crate::engine::queue::BoundedQueue;
use crate::error::{EngineError, Result};

/// Runtime handing out simulated devices
pub struct SimRuntime {
    config: DeviceConfig,
    opened: AtomicUsize,
}

impl SimRuntime {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            opened: AtomicUsize::new(0),
        }
    }
}

impl Runtime for SimRuntime {
    fn open_device(&self) -> Result<Arc<dyn Device>> {
        if self.config.devices == 0 {
            return Err(EngineError::DeviceInit("no accelerator devices found".to_string()));
        }
        if self.config.workers == 0 || self.config.max_in_flight == 0 {
            return Err(EngineError::DeviceInit(
                "device needs at least one worker and one in-flight slot".to_string(),
            ));
        }

        let index = self.opened.fetch_add(1, Ordering::Relaxed) % self.config.devices;
        let id = format!("sim{}", index);
        info!("Opened simulated accelerator {}", id);

        Ok(Arc::new(SimDevice {
            id,
            config: self.config.clone(),
        }))
    }
}

/// One simulated accelerator context
pub struct SimDevice {
    id: String,
    config: DeviceConfig,
}

#[derive(Debug, Deserialize)]
struct ModelFile {
    name: String,
    inputs: Vec<StreamInfo>,
    outputs: Vec<StreamInfo>,
}

impl ModelFile {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.inputs.is_empty() {
            return Err("model declares no inputs".to_string());
        }
        if self.outputs.is_empty() {
            return Err("model declares no outputs".to_string());
        }

        let mut names = HashSet::new();
        for stream in self.inputs.iter().chain(self.outputs.iter()) {
            if !names.insert(stream.name.as_str()) {
                return Err(format!("duplicate stream name `{}`", stream.name));
            }
            match stream.checked_frame_size() {
                None => return Err(format!("stream `{}` is too large", stream.name)),
                Some(0) => return Err(format!("stream `{}` has an empty shape", stream.name)),
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl Device for SimDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn compile_model(&self, path: &Path) -> Result<Arc<dyn InferModel>> {
        let model_load = |reason: String| EngineError::ModelLoad {
            path: path.to_path_buf(),
            reason,
        };

        let content = std::fs::read_to_string(path).map_err(|e| model_load(e.to_string()))?;
        let file: ModelFile = toml::from_str(&content).map_err(|e| model_load(e.to_string()))?;
        file.validate().map_err(model_load)?;

        debug!(
            "Compiled {} for {}: {} inputs, {} outputs",
            file.name,
            self.id,
            file.inputs.len(),
            file.outputs.len()
        );

        Ok(Arc::new(SimModel {
            name: file.name,
            device_id: self.id.clone(),
            config: self.config.clone(),
            inputs: file.inputs,
            outputs: Mutex::new(file.outputs),
            batch_size: Mutex::new(None),
            configured: AtomicBool::new(false),
        }))
    }
}

/// Compiled, not yet configured, simulated model
pub struct SimModel {
    name: String,
    device_id: String,
    config: DeviceConfig,
    inputs: Vec<StreamInfo>,
    outputs: Mutex<Vec<StreamInfo>>,
    batch_size: Mutex<Option<u32>>,
    configured: AtomicBool,
}

impl SimModel {
    fn ensure_unconfigured(&self, what: &str) -> Result<()> {
        if self.configured.load(Ordering::Acquire) {
            return Err(EngineError::Config(format!(
                "cannot change {} of {} after configure",
                what, self.name
            )));
        }
        Ok(())
    }
}

impl InferModel for SimModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> Vec<StreamInfo> {
        self.inputs.clone()
    }

    fn outputs(&self) -> Vec<StreamInfo> {
        self.outputs.lock().clone()
    }

    fn set_output_format(&self, output: &str, format: FormatType) -> Result<()> {
        self.ensure_unconfigured("output format")?;
        let mut outputs = self.outputs.lock();
        let stream = outputs
            .iter_mut()
            .find(|o| o.name == output)
            .ok_or_else(|| EngineError::Config(format!("no output named `{}`", output)))?;

        let resized = StreamInfo {
            format,
            ..stream.clone()
        };
        if resized.checked_frame_size().is_none() {
            return Err(EngineError::Config(format!(
                "output `{}` is too large as {}",
                output, format
            )));
        }
        stream.format = format;
        Ok(())
    }

    fn set_batch_size(&self, batch_size: u32) -> Result<()> {
        self.ensure_unconfigured("batch size")?;
        if batch_size == 0 {
            return Err(EngineError::Config("batch size must be at least 1".to_string()));
        }
        *self.batch_size.lock() = Some(batch_size);
        Ok(())
    }

    fn batch_size(&self) -> Option<u32> {
        *self.batch_size.lock()
    }

    fn configure(&self) -> Result<Arc<dyn ConfiguredModel>> {
        self.configured.store(true, Ordering::Release);
        let configured = SimConfiguredModel::start(
            &self.device_id,
            self.inputs.clone(),
            self.outputs(),
            &self.config,
        )?;
        info!(
            "Configured {} on {} (batch size {:?}, {} workers)",
            self.name,
            self.device_id,
            self.batch_size(),
            self.config.workers
        );
        Ok(Arc::new(configured))
    }
}

struct SimJob {
    id: u64,
    buffers: BoundBuffers,
    on_complete: CompletionCallback,
    completer: JobCompleter,
}

/// Bounded count of accepted but unfinished jobs
struct InFlightWindow {
    count: Mutex<usize>,
    cond: Condvar,
    max: usize,
}

impl InFlightWindow {
    fn release(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        drop(count);
        self.cond.notify_all();
    }
}

/// Configured simulated model owning the device worker threads.
///
/// Dropping it stops intake; workers finish accepted jobs and exit.
pub struct SimConfiguredModel {
    inputs: Vec<StreamInfo>,
    outputs: Vec<StreamInfo>,
    submissions: Arc<BoundedQueue<SimJob>>,
    window: Arc<InFlightWindow>,
    next_job: AtomicU64,
}

impl SimConfiguredModel {
    fn start(
        device_id: &str,
        inputs: Vec<StreamInfo>,
        outputs: Vec<StreamInfo>,
        config: &DeviceConfig,
    ) -> Result<Self> {
        let submissions = Arc::new(BoundedQueue::new(config.max_in_flight));
        let window = Arc::new(InFlightWindow {
            count: Mutex::new(0),
            cond: Condvar::new(),
            max: config.max_in_flight,
        });

        for worker in 0..config.workers {
            let submissions = submissions.clone();
            let window = window.clone();
            let latency = config.latency();
            thread::Builder::new()
                .name(format!("{}-accel-{}", device_id, worker))
                .spawn(move || worker_loop(submissions, window, latency))
                .map_err(|e| EngineError::Config(format!("failed to start device worker: {}", e)))?;
        }

        Ok(Self {
            inputs,
            outputs,
            submissions,
            window,
            next_job: AtomicU64::new(0),
        })
    }

    /// Jobs accepted but not yet completed
    pub fn pending(&self) -> usize {
        *self.window.count.lock()
    }
}

impl ConfiguredModel for SimConfiguredModel {
    fn create_bindings(&self) -> Result<Bindings> {
        Ok(Bindings::new(self.inputs.clone(), self.outputs.clone()))
    }

    fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut count = self.window.count.lock();
        let max = self.window.max;
        self.window.cond.wait_while_for(&mut count, |count| *count >= max, timeout);
        if *count >= max {
            return Err(EngineError::ReadyTimeout(timeout));
        }
        Ok(())
    }

    fn run_async(&self, bindings: &Bindings, on_complete: CompletionCallback) -> Result<Job> {
        let buffers = bindings.snapshot()?;

        {
            let mut count = self.window.count.lock();
            if *count >= self.window.max {
                return Err(EngineError::Submit("device async queue is full".to_string()));
            }
            *count += 1;
        }

        let id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let (job, completer) = Job::new(id);
        let submitted = self.submissions.try_push(SimJob {
            id,
            buffers,
            on_complete,
            completer,
        });

        if let Err(e) = submitted {
            self.window.release();
            return Err(EngineError::Submit(format!("device rejected job {}: {}", id, e)));
        }

        debug!("Accepted job {}", id);
        Ok(job)
    }
}

impl Drop for SimConfiguredModel {
    fn drop(&mut self) {
        self.submissions.close();
    }
}

fn worker_loop(submissions: Arc<BoundedQueue<SimJob>>, window: Arc<InFlightWindow>, latency: Duration) {
    while let Ok(job) = submissions.pop() {
        let SimJob {
            id,
            buffers,
            on_complete,
            completer,
        } = job;

        if !latency.is_zero() {
            thread::sleep(latency);
        }

        let status = execute(&buffers);
        // The device is done with the memory once execution returns.
        drop(buffers);

        let info = CompletionInfo { job_id: id, status };
        if catch_unwind(AssertUnwindSafe(move || on_complete(info))).is_err() {
            error!("Completion callback for job {} panicked", id);
        }

        completer.finish();
        window.release();
    }
    debug!("Device worker exiting");
}

fn execute(buffers: &BoundBuffers) -> JobStatus {
    let source = match buffers.inputs.first() {
        Some((_, view)) => view.to_vec(),
        None => return JobStatus::Failed("job has no input".to_string()),
    };

    for (info, view) in &buffers.outputs {
        let written = view.write(|out| {
            if source.is_empty() {
                out.fill(0);
                return;
            }
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = source[i % source.len()];
            }
        });
        if written.is_none() {
            return JobStatus::Failed(format!("output `{}` is not writable", info.name));
        }
    }

    JobStatus::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::buffer::allocate;
    use std::io::Write;
    use std::sync::mpsc;

    const MODEL: &str = r#"
name = "echo"

[[inputs]]
name = "in"
shape = [8]

[[outputs]]
name = "out"
shape = [4]
format = "uint16"
"#;

    fn write_model(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn device(config: DeviceConfig) -> Arc<dyn Device> {
        SimRuntime::new(config).open_device().unwrap()
    }

    #[test]
    fn test_open_without_devices_fails() {
        let runtime = SimRuntime::new(DeviceConfig {
            devices: 0,
            ..DeviceConfig::default()
        });
        assert!(matches!(runtime.open_device(), Err(EngineError::DeviceInit(_))));
    }

    #[test]
    fn test_compile_errors() {
        let device = device(DeviceConfig::default());

        let missing = device.compile_model(Path::new("no/such/model.toml"));
        assert!(matches!(missing, Err(EngineError::ModelLoad { .. })));

        let file = write_model("name = \"broken\"\ninputs = []\noutputs = []\n");
        let err = device.compile_model(file.path()).err().unwrap();
        assert!(err.to_string().contains("no inputs"));

        let file = write_model(
            "name = \"dup\"\n[[inputs]]\nname = \"x\"\nshape = [1]\n[[outputs]]\nname = \"x\"\nshape = [1]\n",
        );
        let err = device.compile_model(file.path()).err().unwrap();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_oversized_stream_is_load_error() {
        let device = device(DeviceConfig::default());

        let file = write_model(
            "name = \"huge\"\n[[inputs]]\nname = \"x\"\nshape = [4294967296, 4294967296]\n[[outputs]]\nname = \"y\"\nshape = [1]\n",
        );
        let err = device.compile_model(file.path()).err().unwrap();
        assert!(matches!(err, EngineError::ModelLoad { .. }));
        assert!(err.to_string().contains("stream `x` is too large"));

        // Fits as uint8 but not once widened to float32
        let file = write_model(&format!(
            "name = \"wide\"\n[[inputs]]\nname = \"x\"\nshape = [1]\n[[outputs]]\nname = \"y\"\nshape = [{}]\n",
            usize::MAX / 2
        ));
        let model = device.compile_model(file.path()).unwrap();
        assert!(matches!(
            model.set_output_format("y", FormatType::Float32),
            Err(EngineError::Config(_))
        ));
        assert_eq!(model.outputs()[0].format, FormatType::Uint8);
    }

    #[test]
    fn test_model_settings_locked_after_configure() {
        let device = device(DeviceConfig::default());
        let file = write_model(MODEL);
        let model = device.compile_model(file.path()).unwrap();

        assert!(matches!(model.set_batch_size(0), Err(EngineError::Config(_))));
        model.set_batch_size(4).unwrap();
        model.set_output_format("out", FormatType::Float32).unwrap();
        assert_eq!(model.outputs()[0].frame_size(), 16);
        assert!(model.set_output_format("nope", FormatType::Uint8).is_err());

        let _configured = model.configure().unwrap();
        assert_eq!(model.batch_size(), Some(4));
        assert!(matches!(model.set_batch_size(8), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_run_async_echoes_input() {
        let device = device(DeviceConfig {
            latency_ms: 0,
            ..DeviceConfig::default()
        });
        let file = write_model(MODEL);
        let configured = device.compile_model(file.path()).unwrap().configure().unwrap();
        let mut bindings = configured.create_bindings().unwrap();

        let input = allocate(8).unwrap();
        input.copy_from(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let output = allocate(8).unwrap();
        bindings.set_input_buffer("in", input.full_view()).unwrap();
        bindings.set_output_buffer("out", output.full_view()).unwrap();

        let (tx, rx) = mpsc::channel();
        configured.wait_ready(Duration::from_secs(1)).unwrap();
        let job = configured
            .run_async(
                &bindings,
                Box::new(move |info| {
                    let thread_name = thread::current().name().map(str::to_string);
                    tx.send((info.status, thread_name)).unwrap();
                }),
            )
            .unwrap();

        assert!(job.wait(Duration::from_secs(5)));
        let (status, thread_name) = rx.recv().unwrap();
        assert_eq!(status, JobStatus::Success);
        assert!(thread_name.unwrap().starts_with("sim0-accel-"));
        assert_eq!(output.to_vec(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_unbound_slots_rejected() {
        let device = device(DeviceConfig::default());
        let file = write_model(MODEL);
        let configured = device.compile_model(file.path()).unwrap().configure().unwrap();
        let bindings = configured.create_bindings().unwrap();

        let result = configured.run_async(&bindings, Box::new(|_| {}));
        assert!(matches!(result, Err(EngineError::Binding(_))));
    }

    #[test]
    fn test_wait_ready_times_out_when_window_full() {
        let device = device(DeviceConfig {
            devices: 1,
            workers: 1,
            max_in_flight: 1,
            latency_ms: 200,
        });
        let file = write_model(MODEL);
        let configured = device.compile_model(file.path()).unwrap().configure().unwrap();
        let mut bindings = configured.create_bindings().unwrap();
        bindings.set_input_buffer("in", allocate(8).unwrap().full_view()).unwrap();
        bindings.set_output_buffer("out", allocate(8).unwrap().full_view()).unwrap();

        let job = configured.run_async(&bindings, Box::new(|_| {})).unwrap();
        assert!(matches!(
            configured.wait_ready(Duration::from_millis(10)),
            Err(EngineError::ReadyTimeout(_))
        ));
        assert!(matches!(
            configured.run_async(&bindings, Box::new(|_| {})),
            Err(EngineError::Submit(_))
        ));

        assert!(job.wait(Duration::from_secs(5)));
        configured.wait_ready(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_panicking_callback_does_not_kill_worker() {
        let device = device(DeviceConfig {
            devices: 1,
            workers: 1,
            max_in_flight: 2,
            latency_ms: 0,
        });
        let file = write_model(MODEL);
        let configured = device.compile_model(file.path()).unwrap().configure().unwrap();
        let mut bindings = configured.create_bindings().unwrap();
        bindings.set_input_buffer("in", allocate(8).unwrap().full_view()).unwrap();
        bindings.set_output_buffer("out", allocate(8).unwrap().full_view()).unwrap();

        let first = configured
            .run_async(&bindings, Box::new(|_| panic!("callback failure")))
            .unwrap();
        assert!(first.wait(Duration::from_secs(5)));

        let (tx, rx) = mpsc::channel();
        let second = configured
            .run_async(&bindings, Box::new(move |info| tx.send(info.job_id).unwrap()))
            .unwrap();
        assert!(second.wait(Duration::from_secs(5)));
        assert_eq!(rx.recv().unwrap(), second.id());
    }
}
