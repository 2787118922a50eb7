//! Buffer bindings
//!
//! Associates each named model input and output with the buffer the next job
//! reads from or writes into. One `Bindings` object is created per configured
//! model and rebound in place for every request.

use crate::device::traits::StreamInfo;
use crate::engine::buffer::BufferView;
use crate::error::BindError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

/// One accelerator-visible buffer slot
#[derive(Debug)]
pub struct BindingSlot {
    info: StreamInfo,
    direction: Direction,
    buffer: Option<BufferView>,
}

impl BindingSlot {
    fn new(info: StreamInfo, direction: Direction) -> Self {
        Self {
            info,
            direction,
            buffer: None,
        }
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Bind `view`; its length must equal the stream's frame size
    pub fn set_buffer(&mut self, view: BufferView) -> Result<(), BindError> {
        let expected = self.info.frame_size();
        if view.len() != expected {
            return Err(BindError::SizeMismatch {
                name: self.info.name.clone(),
                expected,
                actual: view.len(),
            });
        }
        if self.direction == Direction::Output && !view.is_writable() {
            return Err(BindError::ReadOnly(self.info.name.clone()));
        }
        self.buffer = Some(view);
        Ok(())
    }

    pub fn buffer(&self) -> Option<&BufferView> {
        self.buffer.as_ref()
    }
}

/// Per-model set of input and output slots
#[derive(Debug)]
pub struct Bindings {
    inputs: Vec<BindingSlot>,
    outputs: Vec<BindingSlot>,
}

/// Buffers captured from `Bindings` at submission time, in stream order
#[derive(Debug, Clone)]
pub struct BoundBuffers {
    pub inputs: Vec<(StreamInfo, BufferView)>,
    pub outputs: Vec<(StreamInfo, BufferView)>,
}

impl Bindings {
    pub fn new(inputs: Vec<StreamInfo>, outputs: Vec<StreamInfo>) -> Self {
        Self {
            inputs: inputs.into_iter().map(|i| BindingSlot::new(i, Direction::Input)).collect(),
            outputs: outputs.into_iter().map(|o| BindingSlot::new(o, Direction::Output)).collect(),
        }
    }

    pub fn input(&mut self, name: &str) -> Option<&mut BindingSlot> {
        self.inputs.iter_mut().find(|s| s.info.name == name)
    }

    pub fn output(&mut self, name: &str) -> Option<&mut BindingSlot> {
        self.outputs.iter_mut().find(|s| s.info.name == name)
    }

    pub fn set_input_buffer(&mut self, name: &str, view: BufferView) -> Result<(), BindError> {
        self.input(name)
            .ok_or_else(|| BindError::UnknownStream(name.to_string()))?
            .set_buffer(view)
    }

    pub fn set_output_buffer(&mut self, name: &str, view: BufferView) -> Result<(), BindError> {
        self.output(name)
            .ok_or_else(|| BindError::UnknownStream(name.to_string()))?
            .set_buffer(view)
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|s| s.info.name.as_str())
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|s| s.info.name.as_str())
    }

    /// Drop every bound buffer reference held by the slots
    pub fn reset(&mut self) {
        for slot in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            slot.buffer = None;
        }
    }

    /// Capture the bound buffers, failing if any slot is empty
    pub fn snapshot(&self) -> Result<BoundBuffers, BindError> {
        fn collect(slots: &[BindingSlot]) -> Result<Vec<(StreamInfo, BufferView)>, BindError> {
            slots
                .iter()
                .map(|slot| match &slot.buffer {
                    Some(view) => Ok((slot.info.clone(), view.clone())),
                    None => Err(BindError::Unbound(slot.info.name.clone())),
                })
                .collect()
        }

        Ok(BoundBuffers {
            inputs: collect(&self.inputs)?,
            outputs: collect(&self.outputs)?,
        })
    }
}
