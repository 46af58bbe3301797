use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use accelrt::{DeviceInfo, Precision, Runtime};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::backends::{CompiledEngine, GraphEngine};
use crate::buffer::TensorData;
use crate::error::{Error, Result};
use crate::tensor::{InputTensorInfo, OutputTensorInfo, TensorInfo};

/// Backends an [Engine] can be created for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Graph executor on the CPU
    Cpu,
    /// Compiled plans on an accelerator device
    Accelerator,
}
impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Accelerator => f.write_str("accelerator"),
        }
    }
}

/// Lifecycle of an [Engine]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Unconfigured,
    Initialized,
    Preprocessed,
    Invoked,
    Finalized,
    /// Initialization or execution failed; only [Engine::finalize] is allowed
    Failed,
}
impl State {
    pub(crate) fn check(self, op: &'static str, allowed: &[State]) -> Result<()> {
        if allowed.contains(&self) {
            Ok(())
        } else {
            Err(Error::InvalidState { op, state: self })
        }
    }

    /// States in which tensor buffers exist
    pub(crate) const READY: &'static [State] =
        &[State::Initialized, State::Preprocessed, State::Invoked];
}
impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unconfigured => "unconfigured",
            Self::Initialized => "initialized",
            Self::Preprocessed => "preprocessed",
            Self::Invoked => "invoked",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        })
    }
}

/// One interface over every inference backend
///
/// The call order is [initialize](Engine::initialize), then any number of
/// [preprocess](Engine::preprocess) and [invoke](Engine::invoke) rounds, then
/// [finalize](Engine::finalize). Descriptors passed to `initialize` are completed in place and
/// must be handed back to the later calls.
pub trait Engine: Send {
    fn kind(&self) -> EngineKind;

    fn state(&self) -> State;

    /// Limit the worker threads used for preprocessing and CPU execution
    fn set_num_threads(&mut self, num_threads: usize) -> Result<()>;

    /// Load `model` and bind the descriptors to its tensors
    ///
    /// Unset types, shapes and quantization parameters are filled in from the model.
    fn initialize(
        &mut self,
        model: &Path,
        inputs: &mut [InputTensorInfo],
        outputs: &mut [OutputTensorInfo],
    ) -> Result<()>;

    /// Release everything the engine holds
    fn finalize(&mut self) -> Result<()>;

    /// Convert one frame per input into the model's input tensors
    fn preprocess(&mut self, inputs: &[InputTensorInfo], frames: &[&[u8]]) -> Result<()>;

    /// Run the model; output descriptors get the shapes the model produced
    fn invoke(&mut self, outputs: &mut [OutputTensorInfo]) -> Result<()>;

    /// Data of a bound input or output tensor
    fn tensor_data(&self, tensor: &TensorInfo) -> Result<TensorData<'_>>;

    /// Number of completed invocations
    fn generation(&self) -> u64;
}

/// Int8 calibration settings for accelerator builds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationOptions {
    /// Directory with the calibration images and their manifest
    pub dir: PathBuf,
    /// Manifest listing one image file per line
    pub list_file: String,
    /// Input binding the images are fed to
    pub input_name: String,
    pub batch_size: usize,
    pub nb_batches: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub scale: f32,
    pub bias: f32,
    /// Reuse the calibration table next to the model if one exists
    pub read_cache: bool,
}
impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("calibration"),
            list_file: "list.txt".into(),
            input_name: "data".into(),
            batch_size: 10,
            nb_batches: 2,
            channels: 3,
            height: 224,
            width: 224,
            scale: 1.0 / 255.0,
            bias: 0.0,
            read_cache: true,
        }
    }
}

/// Backend settings beyond the [EngineKind]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EngineOptions {
    pub precision: Precision,
    pub calibration: Option<CalibrationOptions>,
    /// Accelerator device index
    pub device: usize,
    pub dla_core: Option<u32>,
}

/// Create an engine with default options
pub fn create(kind: EngineKind) -> Result<Box<dyn Engine>> {
    create_with(kind, &EngineOptions::default())
}

/// Create an engine of the given kind
///
/// # Errors
///
/// Returns a configuration error if the backend isn't available in this build or the device
/// doesn't exist.
pub fn create_with(kind: EngineKind, options: &EngineOptions) -> Result<Box<dyn Engine>> {
    match kind {
        EngineKind::Cpu => {
            info!("using the CPU graph executor");
            Ok(Box::new(GraphEngine::new()?))
        }
        EngineKind::Accelerator => {
            let device = accelrt::list_devices()
                .nth(options.device)
                .ok_or(accelrt::Error::NoDevice(options.device))?;
            info!("using accelerator {} ({})", device.index(), device.name());

            Ok(Box::new(CompiledEngine::with_runtime(
                accelerator_runtime(device)?,
                options.clone(),
            )))
        }
    }
}

#[cfg(feature = "onnx")]
fn accelerator_runtime(device: DeviceInfo) -> Result<Arc<dyn Runtime>> {
    Ok(Arc::new(accelrt::HostRuntime::new(device)))
}

#[cfg(not(feature = "onnx"))]
fn accelerator_runtime(_device: DeviceInfo) -> Result<Arc<dyn Runtime>> {
    Err(Error::Configuration(
        "accelerator support needs the `onnx` feature".into(),
    ))
}

pub(crate) fn thread_pool(num_threads: usize) -> Result<ThreadPool> {
    if num_threads == 0 {
        return Err(Error::Configuration("thread count must be at least 1".into()));
    }

    ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|i| format!("inference-{i}"))
        .build()
        .map_err(|err| Error::Configuration(format!("failed to build thread pool: {err}")))
}

/// Run `op` on `pool`, or on the global pool if there is none
pub(crate) fn install<R: Send>(pool: Option<&ThreadPool>, op: impl FnOnce() -> R + Send) -> R {
    match pool {
        Some(pool) => pool.install(op),
        None => op(),
    }
}

pub(crate) fn check_frames(inputs: &[InputTensorInfo], frames: &[&[u8]]) -> Result<()> {
    if inputs.len() != frames.len() {
        return Err(Error::Configuration(format!(
            "{} frames for {} inputs",
            frames.len(),
            inputs.len()
        )));
    }
    Ok(())
}
