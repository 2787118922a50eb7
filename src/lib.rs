//! Asynchronous Accelerator Inference Pipeline Library

pub mod bench;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;

pub use config::Config;
pub use engine::{AsyncInferEngine, BoundedQueue, InferenceOutputItem, PageBuffer};
pub use error::{EngineError, QueueError};
