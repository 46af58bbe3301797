use crate::{DataType, DevicePtr};

/// Errors raised by the accelerator runtime
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of device memory: requested {requested} bytes with {in_use} of {limit} in use")]
    OutOfMemory {
        requested: u64,
        in_use: u64,
        limit: u64,
    },
    #[error("invalid device pointer {0:?}")]
    InvalidPointer(DevicePtr),
    #[error("copy of {len} bytes does not match device buffer of {size} bytes")]
    SizeMismatch { len: usize, size: usize },
    #[error("binding `{name}` has unsupported data type {data_type:?}")]
    UnsupportedDataType { name: String, data_type: DataType },
    #[error("failed to parse network: {0}")]
    Parse(String),
    #[error("failed to build plan: {0}")]
    Build(String),
    #[error("failed to deserialize plan: {0}")]
    Deserialize(String),
    #[error("failed to create execution context: {0}")]
    ContextCreation(String),
    #[error("launch failed: {0}")]
    Launch(String),
    #[error("calibration failed: {0}")]
    Calibration(String),
    #[error("no accelerator device at index {0}")]
    NoDevice(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
