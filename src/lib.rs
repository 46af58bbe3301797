//!
//! One interface over interchangeable neural network inference backends
//!
//! Pick a backend with [create], describe the model's tensors with [InputTensorInfo] and
//! [OutputTensorInfo], then drive the [Engine] through initialize, preprocess, invoke and
//! finalize.
//!

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

pub mod backends;
mod buffer;
pub mod config;
mod engine;
mod error;
pub mod logger;
pub mod net;
pub mod preprocess;
mod tensor;
#[cfg(test)]
mod testing;

pub use accelrt::Precision;
pub use buffer::{HostBuffer, TensorData};
pub use engine::{
    create, create_with, CalibrationOptions, Engine, EngineKind, EngineOptions, State,
};
pub use error::{Error, ErrorKind, Result};
pub use tensor::{
    ColorOrder, Dims, FusedNormalize, ImageRegion, InputTensorInfo, Layout, Normalize,
    OutputTensorInfo, Quant, SourceFormat, TensorInfo, TensorType,
};
