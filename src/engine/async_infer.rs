//! Asynchronous Inference Engine
//!
//! Binds caller buffers to a configured model, submits jobs that run on the
//! accelerator's own threads, and publishes each finished job to a bounded
//! result queue from the completion callback.
//!
//! Buffers used by a job are guarded by strong references. With the default
//! `GuardPolicy::Retain` the engine keeps every guard until `clear()` is
//! called, so recycling is batched and controlled by the caller.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::binding::Bindings;
use super::buffer::{allocate, PageBuffer};
use super::item::{InferenceOutputItem, OutputDescriptor, OutputTensor};
use super::queue::BoundedQueue;
use crate::config::{EngineConfig, GuardPolicy};
use crate::device::traits::{
    CompletionCallback, CompletionInfo, ConfiguredModel, Device, InferModel, JobStatus, Runtime,
    StreamInfo,
};
use crate::error::{EngineError, Result};

pub type ResultQueue = BoundedQueue<InferenceOutputItem>;

/// A compiled model and the metadata derived from it at load time
struct LoadedModel {
    model: Arc<dyn InferModel>,
    inputs: Vec<StreamInfo>,
    outputs: Vec<StreamInfo>,
    descriptors: HashMap<String, Arc<OutputDescriptor>>,
    /// Sum of input frame sizes
    input_frame_size: usize,
}

/// State that exists once the model has been configured
struct Session {
    configured: Arc<dyn ConfiguredModel>,
    bindings: Bindings,
    queue: Arc<ResultQueue>,
}

/// Buffers kept alive on behalf of submitted jobs
#[derive(Default)]
struct GuardSet {
    inputs: Vec<PageBuffer>,
    outputs: Vec<PageBuffer>,
}

impl GuardSet {
    fn len(&self) -> usize {
        self.inputs.len() + self.outputs.len()
    }

    fn clear(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
    }
}

/// Count of submitted jobs whose completion has not run yet
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn get(&self) -> usize {
        *self.count.lock()
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        self.idle.wait_while_for(&mut count, |count| *count > 0, timeout);
        *count == 0
    }
}

/// Asynchronous inference engine over one accelerator device
pub struct AsyncInferEngine {
    runtime: Arc<dyn Runtime>,
    config: EngineConfig,
    device: Option<Arc<dyn Device>>,
    model: Option<LoadedModel>,
    session: Mutex<Option<Session>>,
    guards: Mutex<GuardSet>,
    in_flight: Arc<InFlight>,
}

impl AsyncInferEngine {
    /// Create an engine; no device is opened until `initialize` or `open_device`
    pub fn new(runtime: Arc<dyn Runtime>, config: EngineConfig) -> Self {
        Self {
            runtime,
            config,
            device: None,
            model: None,
            session: Mutex::new(None),
            guards: Mutex::new(GuardSet::default()),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Open the device, load the model at `model_path` and configure it to
    /// publish results into `result_queue`.
    ///
    /// Calling this again replaces the model, bindings and queue. Guards
    /// retained for earlier jobs stay alive until `clear()`.
    pub fn initialize(&mut self, model_path: impl AsRef<Path>, result_queue: Arc<ResultQueue>) -> Result<()> {
        self.config.validate()?;
        self.open_device()?;
        self.load_model(model_path)?;
        self.configure(result_queue)
    }

    /// Open the accelerator device if it is not open yet
    pub fn open_device(&mut self) -> Result<Arc<dyn Device>> {
        if let Some(device) = &self.device {
            return Ok(device.clone());
        }

        let device = self.runtime.open_device().map_err(|e| {
            error!("Failed to open accelerator device: {}", e);
            e
        })?;
        info!("Accelerator device {} opened", device.id());
        self.device = Some(device.clone());
        Ok(device)
    }

    /// Compile the model at `path`, apply output format and batch size, and
    /// build the output descriptor map.
    ///
    /// Any previous model and bindings are discarded first, so a failure
    /// leaves the engine uninitialized.
    pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.model = None;
        *self.session.get_mut() = None;

        let device = self.open_device()?;

        info!("Loading model from {}", path.display());
        let start = Instant::now();

        let model = device.compile_model(path).map_err(|e| {
            error!("Failed to create infer model: {}", e);
            e
        })?;

        for output in model.outputs() {
            model.set_output_format(&output.name, self.config.output_format)?;
        }
        if let Some(batch_size) = self.config.batch_size {
            model.set_batch_size(batch_size)?;
        }

        let inputs = model.inputs();
        let outputs = model.outputs();
        let input_frame_size = inputs
            .iter()
            .try_fold(0usize, |total, info| total.checked_add(info.checked_frame_size()?))
            .ok_or_else(|| EngineError::Config(format!("inputs of {} are too large", model.name())))?;
        if outputs.iter().any(|o| o.checked_frame_size().is_none()) {
            return Err(EngineError::Config(format!("outputs of {} are too large", model.name())));
        }
        let descriptors = outputs
            .iter()
            .map(|o| (o.name.clone(), Arc::new(OutputDescriptor::from(o))))
            .collect();

        {
            let mut guards = self.guards.lock();
            guards.inputs.reserve(inputs.len());
            guards.outputs.reserve(outputs.len());
        }

        info!(
            "Model {} loaded in {:?} ({} inputs, {} outputs)",
            model.name(),
            start.elapsed(),
            inputs.len(),
            outputs.len()
        );

        self.model = Some(LoadedModel {
            model,
            inputs,
            outputs,
            descriptors,
            input_frame_size,
        });
        Ok(())
    }

    /// Configure the loaded model, create its bindings and record the result queue
    pub fn configure(&mut self, result_queue: Arc<ResultQueue>) -> Result<()> {
        let loaded = self.model.as_ref().ok_or(EngineError::NotInitialized)?;

        let configured = loaded.model.configure()?;
        let bindings = configured.create_bindings()?;

        *self.session.get_mut() = Some(Session {
            configured,
            bindings,
            queue: result_queue,
        });
        debug!("Engine configured for {}", loaded.model.name());
        Ok(())
    }

    /// Submit one frame for asynchronous inference.
    ///
    /// Inputs are bound as consecutive slices of `input` in model input order,
    /// and a fresh page-aligned buffer is allocated for every output. Returns
    /// once the runtime has accepted the job; the result arrives later on the
    /// result queue tagged with `frame_index`.
    pub fn infer(&self, input: &PageBuffer, frame_index: usize) -> Result<()> {
        let loaded = self.model.as_ref().ok_or(EngineError::NotInitialized)?;
        let mut session = self.session.lock();
        let session = session.as_mut().ok_or(EngineError::NotInitialized)?;

        let required = loaded.input_frame_size;
        if input.len() < required {
            return Err(EngineError::BufferTooSmall {
                required,
                actual: input.len(),
            });
        }

        session
            .configured
            .wait_ready(self.config.ready_timeout())
            .map_err(|e| {
                warn!("Failed wait_ready for frame {}: {}", frame_index, e);
                e
            })?;

        let outputs = match bind_buffers(loaded, &mut session.bindings, input) {
            Ok(outputs) => outputs,
            Err(e) => {
                error!("Abandoning frame {}: {}", frame_index, e);
                session.bindings.reset();
                return Err(e);
            }
        };

        let output_guards: Vec<PageBuffer> = outputs.iter().map(|o| o.buffer.buffer().clone()).collect();
        let input_guards = vec![input.clone(); loaded.inputs.len()];
        let item = InferenceOutputItem { frame_index, outputs };

        // Under the per-job policy the guards ride along with the callback.
        let carried = match self.config.guard_policy {
            GuardPolicy::PerJob => Some((input_guards.clone(), output_guards.clone())),
            GuardPolicy::Retain => None,
        };

        let queue = session.queue.clone();
        let in_flight = self.in_flight.clone();
        let on_complete: CompletionCallback = Box::new(move |info: CompletionInfo| {
            let outcome = catch_unwind(AssertUnwindSafe(|| publish(&queue, item, info)));
            if outcome.is_err() {
                error!("Completion handler panicked for frame {}", frame_index);
            }
            drop(carried);
            in_flight.finish();
        });

        self.in_flight.begin();
        let job = match session.configured.run_async(&session.bindings, on_complete) {
            Ok(job) => job,
            Err(e) => {
                self.in_flight.finish();
                session.bindings.reset();
                error!("Failed to start async infer job for frame {}: {}", frame_index, e);
                return Err(e);
            }
        };

        if self.config.guard_policy == GuardPolicy::Retain {
            let mut guards = self.guards.lock();
            guards.inputs.extend(input_guards);
            guards.outputs.extend(output_guards);
        }

        debug!("Submitted frame {} as job {}", frame_index, job.id());
        job.detach();
        Ok(())
    }

    /// Release every retained buffer guard and binding reference.
    ///
    /// Meant to be called between batches once all submitted jobs have completed.
    pub fn clear(&self) {
        let in_flight = self.in_flight.get();
        if in_flight > 0 {
            warn!("Clearing buffer guards with {} jobs still in flight", in_flight);
        }

        let released = {
            let mut guards = self.guards.lock();
            let released = guards.len();
            guards.clear();
            released
        };

        if let Some(session) = self.session.lock().as_mut() {
            session.bindings.reset();
        }
        debug!("Released {} buffer guards", released);
    }

    /// Block until every submitted job has completed; false on timeout
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.in_flight.wait_idle(timeout)
    }

    pub fn is_initialized(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn device(&self) -> Option<Arc<dyn Device>> {
        self.device.clone()
    }

    pub fn model(&self) -> Option<Arc<dyn InferModel>> {
        self.model.as_ref().map(|m| m.model.clone())
    }

    pub fn configured_model(&self) -> Option<Arc<dyn ConfiguredModel>> {
        self.session.lock().as_ref().map(|s| s.configured.clone())
    }

    pub fn inputs(&self) -> &[StreamInfo] {
        self.model.as_ref().map(|m| m.inputs.as_slice()).unwrap_or_default()
    }

    pub fn outputs(&self) -> &[StreamInfo] {
        self.model.as_ref().map(|m| m.outputs.as_slice()).unwrap_or_default()
    }

    pub fn output_descriptor(&self, name: &str) -> Option<Arc<OutputDescriptor>> {
        self.model.as_ref()?.descriptors.get(name).cloned()
    }

    pub fn queue(&self) -> Option<Arc<ResultQueue>> {
        self.session.lock().as_ref().map(|s| s.queue.clone())
    }

    /// Total bytes of input one `infer` call consumes
    pub fn input_frame_size(&self) -> usize {
        self.model.as_ref().map_or(0, |m| m.input_frame_size)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    /// Number of buffer guards currently held by the engine
    pub fn retained_guards(&self) -> usize {
        self.guards.lock().len()
    }
}

/// Bind input slices and freshly allocated outputs; returns the output
/// tensors in model output order.
fn bind_buffers(loaded: &LoadedModel, bindings: &mut Bindings, input: &PageBuffer) -> Result<Vec<OutputTensor>> {
    let mut offset = 0;
    for info in &loaded.inputs {
        let size = info.frame_size();
        let view = input.view(offset, size).ok_or(EngineError::BufferTooSmall {
            required: offset + size,
            actual: input.len(),
        })?;
        bindings.set_input_buffer(&info.name, view)?;
        offset += size;
    }

    let mut outputs = Vec::with_capacity(loaded.outputs.len());
    for info in &loaded.outputs {
        let buffer = allocate(info.frame_size())?;
        let view = buffer.full_view();
        bindings.set_output_buffer(&info.name, view.clone())?;

        let descriptor = loaded
            .descriptors
            .get(&info.name)
            .cloned()
            .unwrap_or_else(|| Arc::new(OutputDescriptor::from(info)));
        outputs.push(OutputTensor {
            buffer: view,
            descriptor,
        });
    }

    Ok(outputs)
}

/// Completion-side publication: only builds and queues the result
fn publish(queue: &ResultQueue, item: InferenceOutputItem, info: CompletionInfo) {
    let frame_index = item.frame_index;
    if let JobStatus::Failed(reason) = info.status {
        error!("Job {} for frame {} failed: {}", info.job_id, frame_index, reason);
        return;
    }

    if queue.push(item).is_err() {
        warn!("Result queue closed, dropping frame {}", frame_index);
    }
}
