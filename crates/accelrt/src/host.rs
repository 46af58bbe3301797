use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{
    BuilderConfig, DeviceInfo, DevicePtr, Error, Executable, ExecutionContext, Int8Calibrator,
    MemoryStats, MemoryTracker, Network, Plan, Precision, Runtime,
};

/// Turns model files into plans, and plan payloads back into networks
pub trait NetworkCompiler: Send + Sync {
    /// Recorded in every plan this compiler produces
    fn name(&self) -> &str;

    fn compile(
        &self,
        model: &Path,
        config: &BuilderConfig,
        calibrator: Option<&mut dyn Int8Calibrator>,
    ) -> Result<Plan, Error>;

    fn load(&self, plan: &Plan) -> Result<Box<dyn Network>, Error>;
}

/// Accelerator emulated in host memory
///
/// Device allocations live in a map keyed by pointer and are charged against the device's
/// memory limit.
pub struct HostRuntime {
    device: DeviceInfo,
    compiler: Box<dyn NetworkCompiler>,
    memory: Mutex<HashMap<DevicePtr, Vec<u8>>>,
    tracker: MemoryTracker,
    next_ptr: AtomicU64,
}
impl HostRuntime {
    /// Create a runtime on `device` that compiles ONNX models
    #[cfg(feature = "onnx")]
    pub fn new(device: DeviceInfo) -> Self {
        Self::with_compiler(device, Box::new(crate::OnnxCompiler))
    }

    pub fn with_compiler(device: DeviceInfo, compiler: Box<dyn NetworkCompiler>) -> Self {
        let tracker = MemoryTracker::new(device.memory_limit());
        info!(
            "accelerator {} ({}, {} bytes)",
            device.index(),
            device.name(),
            device.memory_limit()
        );

        Self {
            device,
            compiler,
            memory: Mutex::new(HashMap::new()),
            tracker,
            // Keep null out of the handle space
            next_ptr: AtomicU64::new(0x1000),
        }
    }
}
impl Runtime for HostRuntime {
    fn device(&self) -> &DeviceInfo {
        &self.device
    }

    fn build_serialized_network(
        &self,
        model: &Path,
        config: &BuilderConfig,
        calibrator: Option<&mut dyn Int8Calibrator>,
    ) -> Result<Vec<u8>, Error> {
        if config.precision == Precision::Int8 && calibrator.is_none() {
            return Err(Error::Build("int8 builds need a calibrator".into()));
        }
        if let Some(core) = config.dla_core {
            warn!("DLA core {core} requested, but {} has none", self.device.name());
        }
        info!(
            "building {:?} plan for {} (workspace {} bytes)",
            config.precision,
            model.display(),
            config.max_workspace_size
        );

        self.compiler.compile(model, config, calibrator)?.serialize()
    }

    fn deserialize_engine(&self, plan: &[u8]) -> Result<Executable, Error> {
        let plan = Plan::deserialize(plan)?;
        if plan.header.producer != self.compiler.name() {
            return Err(Error::Deserialize(format!(
                "plan was produced by `{}`, this runtime loads `{}`",
                plan.header.producer,
                self.compiler.name()
            )));
        }
        for binding in &plan.header.bindings {
            if binding.byte_size().is_none() {
                return Err(Error::UnsupportedDataType {
                    name: binding.name.clone(),
                    data_type: binding.data_type,
                });
            }
        }

        let network = self.compiler.load(&plan)?;
        Ok(Executable::new(plan.header, network))
    }

    fn malloc(&self, size: usize) -> Result<DevicePtr, Error> {
        self.tracker.allocate(size as u64)?;

        let ptr = DevicePtr::from_raw(self.next_ptr.fetch_add(size.max(1) as u64, Ordering::Relaxed));
        self.memory.lock().insert(ptr, vec![0; size]);
        trace!("malloc {size} bytes at {ptr:?}");

        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), Error> {
        let block = self
            .memory
            .lock()
            .remove(&ptr)
            .ok_or(Error::InvalidPointer(ptr))?;
        self.tracker.deallocate(block.len() as u64);
        trace!("free {} bytes at {ptr:?}", block.len());

        Ok(())
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), Error> {
        let mut memory = self.memory.lock();
        let block = memory.get_mut(&dst).ok_or(Error::InvalidPointer(dst))?;
        if block.len() != src.len() {
            return Err(Error::SizeMismatch {
                len: src.len(),
                size: block.len(),
            });
        }
        block.copy_from_slice(src);

        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), Error> {
        let memory = self.memory.lock();
        let block = memory.get(&src).ok_or(Error::InvalidPointer(src))?;
        if block.len() != dst.len() {
            return Err(Error::SizeMismatch {
                len: dst.len(),
                size: block.len(),
            });
        }
        dst.copy_from_slice(block);

        Ok(())
    }

    fn launch(&self, context: &mut ExecutionContext, bindings: &[DevicePtr]) -> Result<(), Error> {
        if bindings.len() != context.bindings().len() {
            return Err(Error::Launch(format!(
                "{} device buffers for {} bindings",
                bindings.len(),
                context.bindings().len()
            )));
        }

        let mut memory = self.memory.lock();

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for (info, ptr) in context.bindings().iter().zip(bindings) {
            let block = memory.get(ptr).ok_or(Error::InvalidPointer(*ptr))?;
            if info.is_input() {
                inputs.push(block.clone());
            } else {
                outputs.push((*ptr, vec![0u8; block.len()]));
            }
        }

        {
            let inputs: Vec<&[u8]> = inputs.iter().map(Vec::as_slice).collect();
            let mut views: Vec<&mut [u8]> =
                outputs.iter_mut().map(|(_, block)| block.as_mut_slice()).collect();
            context.kernel_mut().forward(&inputs, &mut views)?;
        }

        for (ptr, block) in outputs {
            memory.insert(ptr, block);
        }

        Ok(())
    }

    fn memory_stats(&self) -> MemoryStats {
        self.tracker.stats()
    }
}
