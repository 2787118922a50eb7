//! Error types for the inference pipeline

use std::path::PathBuf;
use std::time::Duration;

/// Failure to reserve a page-aligned region
#[derive(Debug, thiserror::Error)]
#[error("failed to map {size} bytes: {source}")]
pub struct AllocationError {
    pub size: usize,
    #[source]
    pub source: std::io::Error,
}

/// Rejected buffer binding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("no stream named `{0}`")]
    UnknownStream(String),
    #[error("buffer for `{name}` is {actual} bytes, stream frame is {expected} bytes")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("output `{0}` cannot be bound to a read-only buffer")]
    ReadOnly(String),
    #[error("stream `{0}` has no buffer bound")]
    Unbound(String),
}

/// Errors surfaced by the bounded queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("queue is full")]
    Full,
    #[error("queue is empty")]
    Empty,
    #[error("timed out waiting on queue")]
    Timeout,
}

/// Engine and device errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to open accelerator device: {0}")]
    DeviceInit(String),

    #[error("failed to load model {}: {reason}", path.display())]
    ModelLoad { path: PathBuf, reason: String },

    #[error("invalid model configuration: {0}")]
    Config(String),

    #[error("engine is not initialized")]
    NotInitialized,

    #[error("input buffer too small: need {required} bytes, got {actual}")]
    BufferTooSmall { required: usize, actual: usize },

    #[error("buffer binding failed: {0}")]
    Binding(#[from] BindError),

    #[error("accelerator not ready after {0:?}")]
    ReadyTimeout(Duration),

    #[error("failed to submit async job: {0}")]
    Submit(String),

    #[error("result queue closed")]
    QueueClosed,

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}

impl EngineError {
    /// Whether the caller may retry `infer` after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::ReadyTimeout(_) | EngineError::Submit(_) | EngineError::Binding(_)
        )
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
