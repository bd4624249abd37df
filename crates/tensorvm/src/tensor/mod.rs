//! Pool-backed tensors: a shape/stride-described view over an aligned buffer.

mod dtype;
mod shape;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::pool::{self, Buffer};

pub use dtype::DType;
pub use shape::Shape;

/// Element type plus logical shape; the value descriptor used by graph
/// nodes, plans, and kernels alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        TensorSpec { dtype, shape }
    }

    /// Payload size implied by the descriptor.
    pub fn byte_len(&self) -> usize {
        self.shape.num_elements() * self.dtype.size_in_bytes()
    }
}

/// A shaped view over a pool-owned buffer.
///
/// Shape and strides are fixed at construction. The payload may be mutated
/// in place only through [`Tensor::bytes_mut`], which requires the buffer to
/// be uniquely owned, so two live tensors never share a buffer for mutation.
#[derive(Clone)]
pub struct Tensor {
    spec: TensorSpec,
    strides: Vec<usize>,
    buffer: Arc<Buffer>,
}

impl Tensor {
    /// Allocates a zero-filled tensor from the calling thread's pool.
    pub fn zeros(spec: TensorSpec) -> Result<Tensor> {
        if !spec.dtype.is_supported() {
            return Err(EngineError::unsupported_type(spec.dtype));
        }
        let mut buffer = pool::allocate(spec.byte_len().max(1))?;
        buffer.zero();
        let strides = spec.shape.contiguous_strides();
        Ok(Tensor {
            spec,
            strides,
            buffer: Arc::new(buffer),
        })
    }

    /// Builds an `F32` tensor from raw values, validating the length against
    /// the shape.
    pub fn from_f32(shape: impl Into<Shape>, data: &[f32]) -> Result<Tensor> {
        let shape = shape.into();
        if data.len() != shape.num_elements() {
            return Err(EngineError::invalid_input(format!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            )));
        }
        let mut tensor = Tensor::zeros(TensorSpec::new(DType::F32, shape))?;
        tensor.bytes_mut()?[..data.len() * 4].copy_from_slice(bytemuck::cast_slice(data));
        Ok(tensor)
    }

    /// Builds an `F64` tensor from raw values.
    pub fn from_f64(shape: impl Into<Shape>, data: &[f64]) -> Result<Tensor> {
        let shape = shape.into();
        if data.len() != shape.num_elements() {
            return Err(EngineError::invalid_input(format!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            )));
        }
        let mut tensor = Tensor::zeros(TensorSpec::new(DType::F64, shape))?;
        tensor.bytes_mut()?[..data.len() * 8].copy_from_slice(bytemuck::cast_slice(data));
        Ok(tensor)
    }

    /// Fills every element with the same value.
    pub fn splat(spec: TensorSpec, value: f64) -> Result<Tensor> {
        let mut tensor = Tensor::zeros(spec)?;
        match tensor.dtype() {
            DType::F32 => {
                for slot in tensor.f32_mut()? {
                    *slot = value as f32;
                }
            }
            DType::F64 => {
                for slot in tensor.f64_mut()? {
                    *slot = value;
                }
            }
            other => return Err(EngineError::unsupported_type(other)),
        }
        Ok(tensor)
    }

    /// Wraps an existing pool buffer, validating its capacity. Used by the
    /// engine when a plan step aliases a dead input's buffer.
    pub fn from_buffer(buffer: Buffer, spec: TensorSpec) -> Result<Tensor> {
        if !spec.dtype.is_supported() {
            return Err(EngineError::unsupported_type(spec.dtype));
        }
        if buffer.len() < spec.byte_len() {
            return Err(EngineError::runtime(format!(
                "buffer of {} bytes cannot back a tensor of {} bytes",
                buffer.len(),
                spec.byte_len()
            )));
        }
        let strides = spec.shape.contiguous_strides();
        Ok(Tensor {
            spec,
            strides,
            buffer: Arc::new(buffer),
        })
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn dtype(&self) -> DType {
        self.spec.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.spec.shape
    }

    /// Strides in elements, row-major.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn num_elements(&self) -> usize {
        self.spec.shape.num_elements()
    }

    pub fn byte_len(&self) -> usize {
        self.spec.byte_len()
    }

    /// Raw payload bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer.as_slice()[..self.spec.byte_len()]
    }

    /// Mutable payload bytes; fails unless this tensor is the buffer's sole
    /// owner (write access belongs to at most one tensor at a time).
    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        let byte_len = self.spec.byte_len();
        let buffer = Arc::get_mut(&mut self.buffer).ok_or_else(|| {
            EngineError::runtime("cannot mutate a tensor whose buffer is shared")
        })?;
        Ok(&mut buffer.as_mut_slice()[..byte_len])
    }

    pub fn f32(&self) -> Result<&[f32]> {
        self.expect_dtype(DType::F32)?;
        Ok(bytemuck::cast_slice(self.bytes()))
    }

    pub fn f64(&self) -> Result<&[f64]> {
        self.expect_dtype(DType::F64)?;
        Ok(bytemuck::cast_slice(self.bytes()))
    }

    pub fn f32_mut(&mut self) -> Result<&mut [f32]> {
        self.expect_dtype(DType::F32)?;
        Ok(bytemuck::cast_slice_mut(self.bytes_mut()?))
    }

    pub fn f64_mut(&mut self) -> Result<&mut [f64]> {
        self.expect_dtype(DType::F64)?;
        Ok(bytemuck::cast_slice_mut(self.bytes_mut()?))
    }

    /// Whether another live tensor (or plan state) shares the buffer.
    pub fn buffer_is_shared(&self) -> bool {
        Arc::strong_count(&self.buffer) > 1
    }

    /// Recovers the underlying buffer when uniquely owned, for in-place
    /// reuse; hands the tensor back otherwise.
    pub fn try_into_buffer(self) -> std::result::Result<Buffer, Tensor> {
        let Tensor {
            spec,
            strides,
            buffer,
        } = self;
        Arc::try_unwrap(buffer).map_err(|buffer| Tensor {
            spec,
            strides,
            buffer,
        })
    }

    fn expect_dtype(&self, wanted: DType) -> Result<()> {
        if self.spec.dtype != wanted {
            return Err(EngineError::runtime(format!(
                "expected {:?} payload, tensor holds {:?}",
                wanted, self.spec.dtype
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.spec.dtype)
            .field("shape", &self.spec.shape.dims())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_checks_dtype_and_length() {
        let err = Tensor::zeros(TensorSpec::new(DType::I32, Shape::from([2, 2]))).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedType { .. }));

        let err = Tensor::from_f32([2, 2], &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { .. }));
    }

    #[test]
    fn round_trips_payload() {
        let tensor = Tensor::from_f32([2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(tensor.f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(tensor.strides(), &[2, 1]);
        assert_eq!(tensor.bytes().as_ptr() as usize % crate::pool::BUFFER_ALIGN, 0);
    }

    #[test]
    fn shared_buffers_refuse_mutation() {
        let mut tensor = Tensor::from_f32([2], &[1.0, 2.0]).unwrap();
        let alias = tensor.clone();
        assert!(tensor.bytes_mut().is_err());
        drop(alias);
        assert!(tensor.bytes_mut().is_ok());
    }
}
