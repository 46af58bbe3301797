use std::path::Path;

use crate::{
    BuilderConfig, DeviceInfo, DevicePtr, Error, Executable, ExecutionContext, Int8Calibrator,
    MemoryStats,
};

/// A device runtime: plan building, device memory and kernel launches
///
/// Copies and launches are normally issued through a [Stream](crate::Stream), which orders them
/// and only runs them on [synchronize](crate::Stream::synchronize).
pub trait Runtime: Send + Sync {
    fn device(&self) -> &DeviceInfo;

    /// Build a serialized plan from a model file
    ///
    /// A calibrator is required for [Precision::Int8](crate::Precision::Int8) builds.
    fn build_serialized_network(
        &self,
        model: &Path,
        config: &BuilderConfig,
        calibrator: Option<&mut dyn Int8Calibrator>,
    ) -> Result<Vec<u8>, Error>;

    /// Load a serialized plan onto the device
    fn deserialize_engine(&self, plan: &[u8]) -> Result<Executable, Error>;

    /// Allocate `size` bytes of device memory
    fn malloc(&self, size: usize) -> Result<DevicePtr, Error>;

    /// Release device memory returned by [Runtime::malloc]
    fn free(&self, ptr: DevicePtr) -> Result<(), Error>;

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), Error>;

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), Error>;

    /// Run a context over device buffers given in plan binding order
    fn launch(&self, context: &mut ExecutionContext, bindings: &[DevicePtr]) -> Result<(), Error>;

    fn memory_stats(&self) -> MemoryStats;
}
