use crate::error::{Error, Result};
use crate::tensor::TensorType;

/// Owned, typed host memory for one tensor
#[derive(Clone, Debug, PartialEq)]
pub enum HostBuffer {
    U8(Vec<u8>),
    F32(Vec<f32>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}
impl HostBuffer {
    /// Zero-filled buffer of `len` elements
    pub fn zeroed(tensor_type: TensorType, len: usize) -> Result<Self> {
        Ok(match tensor_type {
            TensorType::Uint8 => Self::U8(vec![0; len]),
            TensorType::Fp32 => Self::F32(vec![0.0; len]),
            TensorType::Int32 => Self::I32(vec![0; len]),
            TensorType::Int64 => Self::I64(vec![0; len]),
            TensorType::None => {
                return Err(Error::Allocation(
                    "can't allocate a buffer of unknown type".into(),
                ))
            }
        })
    }

    pub fn tensor_type(&self) -> TensorType {
        match self {
            Self::U8(_) => TensorType::Uint8,
            Self::F32(_) => TensorType::Fp32,
            Self::I32(_) => TensorType::Int32,
            Self::I64(_) => TensorType::Int64,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::U8(v) => v,
            Self::F32(v) => bytemuck::cast_slice(v),
            Self::I32(v) => bytemuck::cast_slice(v),
            Self::I64(v) => bytemuck::cast_slice(v),
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::U8(v) => v,
            Self::F32(v) => bytemuck::cast_slice_mut(v),
            Self::I32(v) => bytemuck::cast_slice_mut(v),
            Self::I64(v) => bytemuck::cast_slice_mut(v),
        }
    }

    /// Address of the first element; changes only if the buffer is reallocated
    pub fn as_ptr(&self) -> *const u8 {
        self.as_bytes().as_ptr()
    }

    pub fn view(&self) -> TensorData<'_> {
        match self {
            Self::U8(v) => TensorData::U8(v),
            Self::F32(v) => TensorData::F32(v),
            Self::I32(v) => TensorData::I32(v),
            Self::I64(v) => TensorData::I64(v),
        }
    }
}

/// Borrowed, typed view of tensor data owned by an engine
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TensorData<'a> {
    U8(&'a [u8]),
    F32(&'a [f32]),
    I32(&'a [i32]),
    I64(&'a [i64]),
}
impl<'a> TensorData<'a> {
    pub fn tensor_type(&self) -> TensorType {
        match self {
            Self::U8(_) => TensorType::Uint8,
            Self::F32(_) => TensorType::Fp32,
            Self::I32(_) => TensorType::Int32,
            Self::I64(_) => TensorType::Int64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        match *self {
            Self::U8(v) => v,
            Self::F32(v) => bytemuck::cast_slice(v),
            Self::I32(v) => bytemuck::cast_slice(v),
            Self::I64(v) => bytemuck::cast_slice(v),
        }
    }
}
