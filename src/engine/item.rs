//! Completed inference results

use std::sync::Arc;

use crate::device::traits::{FormatType, StreamInfo};
use crate::engine::buffer::BufferView;

/// Static metadata of a model output, built once at model load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDescriptor {
    pub name: String,
    pub shape: Vec<usize>,
    pub format: FormatType,
    pub frame_size: usize,
}

impl From<&StreamInfo> for OutputDescriptor {
    fn from(info: &StreamInfo) -> Self {
        Self {
            name: info.name.clone(),
            shape: info.shape.clone(),
            format: info.format,
            frame_size: info.frame_size(),
        }
    }
}

/// One output buffer of a finished job together with its descriptor.
///
/// The view holds a strong reference to the output buffer, so the data stays
/// valid for as long as the tensor is alive.
#[derive(Debug, Clone)]
pub struct OutputTensor {
    pub buffer: BufferView,
    pub descriptor: Arc<OutputDescriptor>,
}

impl OutputTensor {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Copy the raw output bytes out of the buffer
    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.to_vec()
    }

    /// Decode a float32 output; `None` for other formats
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        if self.descriptor.format != FormatType::Float32 {
            return None;
        }
        Some(self.buffer.read(|bytes| {
            bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect()
        }))
    }
}

/// Result of one completed job, delivered through the result queue
#[derive(Debug, Clone)]
pub struct InferenceOutputItem {
    /// Correlation id passed to `infer`
    pub frame_index: usize,
    /// One entry per model output, in model output order
    pub outputs: Vec<OutputTensor>,
}

impl InferenceOutputItem {
    pub fn output(&self, name: &str) -> Option<&OutputTensor> {
        self.outputs.iter().find(|o| o.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::buffer::PageBuffer;

    #[test]
    fn test_descriptor_from_stream() {
        let info = StreamInfo::new("boxes", vec![100, 4], FormatType::Float32);
        let descriptor = OutputDescriptor::from(&info);
        assert_eq!(descriptor.frame_size, 1600);
        assert_eq!(descriptor.shape, vec![100, 4]);
    }

    #[test]
    fn test_decode_f32_output() {
        let bytes: Vec<u8> = [1.5f32, -2.0].iter().flat_map(|f| f.to_le_bytes()).collect();
        let buffer = PageBuffer::from_slice(&bytes).unwrap();
        let descriptor = Arc::new(OutputDescriptor::from(&StreamInfo::new(
            "scores",
            vec![2],
            FormatType::Float32,
        )));

        let item = InferenceOutputItem {
            frame_index: 3,
            outputs: vec![OutputTensor {
                buffer: buffer.full_view(),
                descriptor,
            }],
        };

        let scores = item.output("scores").unwrap();
        assert_eq!(scores.to_f32(), Some(vec![1.5, -2.0]));
        assert_eq!(scores.to_vec().len(), 8);
        assert!(item.output("missing").is_none());
    }
}
