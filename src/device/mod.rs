//! Accelerator device layer
//!
//! The engine talks to hardware only through the traits in `traits`.
//! `sim` provides a software accelerator for tests and benchmarking.

pub mod sim;
pub mod traits;

pub use sim::SimRuntime;
pub use traits::{ConfiguredModel, Device, FormatType, InferModel, Job, JobStatus, Runtime, StreamInfo};
