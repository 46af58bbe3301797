//! Accelerator runtime layer
//!
//! Builds serialized execution plans from model files, owns device memory, and runs plans on
//! ordered streams. The shipped device is emulated on the host; everything above [Runtime]
//! only sees opaque [DevicePtr]s and plan bytes.

#[macro_use]
extern crate log;

mod binding;
mod builder;
mod calibrator;
mod context;
mod device;
mod error;
mod host;
mod memory;
#[cfg(feature = "onnx")]
mod onnx;
mod plan;
mod runtime;
mod stream;

pub use binding::{BindingInfo, DataType, Direction};
pub use builder::{BuilderConfig, Precision};
pub use calibrator::{
    calibrate, entropy_threshold, BatchStream, CalibrationTable, EntropyCalibrator,
    Int8Calibrator, HISTOGRAM_BINS,
};
pub use context::{Executable, ExecutionContext, Kernel, Network};
pub use device::{
    list_devices, DeviceInfo, DeviceKind, DeviceList, DEFAULT_MEMORY_LIMIT, MEMORY_LIMIT_ENV,
};
pub use error::Error;
pub use host::{HostRuntime, NetworkCompiler};
pub use memory::{DevicePtr, MemoryStats, MemoryTracker};
#[cfg(feature = "onnx")]
pub use onnx::OnnxCompiler;
pub use plan::{Plan, PlanHeader};
pub use runtime::Runtime;
pub use stream::Stream;
