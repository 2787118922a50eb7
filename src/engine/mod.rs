//! Inference engine module
//!
//! Provides the asynchronous accelerator pipeline:
//! - Page-aligned, reference-counted buffers
//! - Bounded result queue with backpressure
//! - Buffer bindings and async job submission

pub mod async_infer;
pub mod binding;
pub mod buffer;
pub mod item;
pub mod queue;

pub use async_infer::{AsyncInferEngine, ResultQueue};
pub use binding::Bindings;
pub use buffer::{align_to_page_size, allocate, page_size, BufferView, PageBuffer};
pub use item::{InferenceOutputItem, OutputDescriptor, OutputTensor};
pub use queue::BoundedQueue;
