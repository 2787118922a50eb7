//! Accelerator capability traits
//!
//! Describes the runtime the engine drives: opening a device, compiling a
//! model for it, configuring the model and running jobs asynchronously.
//! Memory crosses this boundary only as `BufferView`s with explicit length.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use tracing::debug;

use crate::engine::binding::Bindings;
use crate::error::Result;

/// Element format of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    #[default]
    Uint8,
    Uint16,
    Float32,
}

impl FormatType {
    /// Width of one element in bytes
    pub fn element_size(&self) -> usize {
        match self {
            FormatType::Uint8 => 1,
            FormatType::Uint16 => 2,
            FormatType::Float32 => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FormatType::Uint8 => "uint8",
            FormatType::Uint16 => "uint16",
            FormatType::Float32 => "float32",
        }
    }
}

impl fmt::Display for FormatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named model input or output
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamInfo {
    pub name: String,
    pub shape: Vec<usize>,
    #[serde(default)]
    pub format: FormatType,
}

impl StreamInfo {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, format: FormatType) -> Self {
        Self {
            name: name.into(),
            shape,
            format,
        }
    }

    /// Number of elements in one frame; `None` if the shape overflows `usize`
    pub fn checked_elements(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }

    /// Size of one frame in bytes; `None` on overflow
    pub fn checked_frame_size(&self) -> Option<usize> {
        self.checked_elements()?.checked_mul(self.format.element_size())
    }

    /// Number of elements in one frame, saturating at `usize::MAX`
    pub fn elements(&self) -> usize {
        self.checked_elements().unwrap_or(usize::MAX)
    }

    /// Size of one frame in bytes, saturating at `usize::MAX`.
    ///
    /// Streams accepted by a device never saturate.
    pub fn frame_size(&self) -> usize {
        self.checked_frame_size().unwrap_or(usize::MAX)
    }
}

/// Entry point of an accelerator runtime
pub trait Runtime: Send + Sync {
    /// Open a device context
    fn open_device(&self) -> Result<Arc<dyn Device>>;
}

/// An opened accelerator context
pub trait Device: Send + Sync {
    fn id(&self) -> &str;

    /// Load and compile the model at `path` for this device
    fn compile_model(&self, path: &Path) -> Result<Arc<dyn InferModel>>;
}

/// A model compiled for a device but not yet configured
pub trait InferModel: Send + Sync {
    fn name(&self) -> &str;

    fn inputs(&self) -> Vec<StreamInfo>;

    fn outputs(&self) -> Vec<StreamInfo>;

    /// Set the element format of one output; only valid before `configure`
    fn set_output_format(&self, output: &str, format: FormatType) -> Result<()>;

    /// Set a fixed batch size; only valid before `configure`
    fn set_batch_size(&self, batch_size: u32) -> Result<()>;

    fn batch_size(&self) -> Option<u32>;

    /// Freeze the model and make it runnable
    fn configure(&self) -> Result<Arc<dyn ConfiguredModel>>;
}

/// A configured model that accepts asynchronous jobs
pub trait ConfiguredModel: Send + Sync {
    /// Create the binding object for this model's streams
    fn create_bindings(&self) -> Result<Bindings>;

    /// Block until the runtime can accept another async job
    fn wait_ready(&self, timeout: Duration) -> Result<()>;

    /// Submit a job over the buffers currently set in `bindings`.
    ///
    /// `on_complete` runs exactly once on a runtime-owned thread when the job
    /// finishes. The runtime keeps its own references to every bound buffer
    /// until then.
    fn run_async(&self, bindings: &Bindings, on_complete: CompletionCallback) -> Result<Job>;
}

/// Outcome of a finished job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Failed(String),
}

/// Passed to the completion callback
#[derive(Debug, Clone)]
pub struct CompletionInfo {
    pub job_id: u64,
    pub status: JobStatus,
}

pub type CompletionCallback = Box<dyn FnOnce(CompletionInfo) + Send + 'static>;

struct JobState {
    done: Mutex<bool>,
    cond: Condvar,
}

/// Handle to a submitted job.
///
/// Dropping a job that was not detached waits for it to finish.
pub struct Job {
    id: u64,
    state: Arc<JobState>,
    detached: bool,
}

/// Runtime-side half of a job; marks the job finished when dropped
pub struct JobCompleter(Arc<JobState>);

impl Job {
    pub fn new(id: u64) -> (Job, JobCompleter) {
        let state = Arc::new(JobState {
            done: Mutex::new(false),
            cond: Condvar::new(),
        });
        let job = Job {
            id,
            state: state.clone(),
            detached: false,
        };
        (job, JobCompleter(state))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_done(&self) -> bool {
        *self.state.done.lock()
    }

    /// Wait for completion; returns false on timeout
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut done = self.state.done.lock();
        if !*done {
            self.state.cond.wait_while_for(&mut done, |done| !*done, timeout);
        }
        *done
    }

    /// Let the job run to completion without waiting for it
    pub fn detach(mut self) {
        debug!("Detaching job {}", self.id);
        self.detached = true;
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let mut done = self.state.done.lock();
        self.state.cond.wait_while(&mut done, |done| !*done);
    }
}

impl JobCompleter {
    pub fn finish(self) {}
}

impl Drop for JobCompleter {
    fn drop(&mut self) {
        *self.0.done.lock() = true;
        self.0.cond.notify_all();
    }
}
