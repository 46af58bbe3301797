use std::fs;
use std::path::Path;
use std::sync::Arc;

use accelrt::{
    BatchStream, BindingInfo, BuilderConfig, DataType, DevicePtr, EntropyCalibrator, Executable,
    ExecutionContext, Precision, Runtime, Stream,
};
use rayon::ThreadPool;

use crate::buffer::{HostBuffer, TensorData};
use crate::engine::{self, Engine, EngineKind, EngineOptions, State};
use crate::error::{Error, Result};
use crate::preprocess;
use crate::tensor::{
    next_engine_id, Binding, FusedNormalize, InputTensorInfo, Layout, OutputTensorInfo, Quant,
    TensorInfo, TensorType,
};

/// Extension of plans built from and cached next to a model
pub const PLAN_EXTENSION: &str = "trt";
/// Extension of int8 calibration tables cached next to a model
pub const CALIBRATION_EXTENSION: &str = "calib";

/// Zero point of int8 bindings as the host sees them
///
/// Devices store int8 as two's complement; host buffers hold the same values offset by 128
/// so they fit the unsigned quantized tensor type.
const INT8_ZERO_POINT: i32 = 128;

struct DeviceBinding {
    info: BindingInfo,
    host: HostBuffer,
    device: DevicePtr,
}

fn tensor_type(info: &BindingInfo) -> Result<TensorType> {
    match info.data_type {
        DataType::Float | DataType::Half => Ok(TensorType::Fp32),
        DataType::Int8 => Ok(TensorType::Uint8),
        DataType::Int32 => Ok(TensorType::Int32),
        data_type => Err(Error::Allocation(format!(
            "binding `{}` has unsupported data type {data_type:?}",
            info.name
        ))),
    }
}

/// Convert int8 host buffers of one direction between the offset and two's complement forms
///
/// Flipping the sign bit maps `q + 128` to `q` as a signed byte and back.
fn flip_int8(bindings: &mut [DeviceBinding], input: bool) {
    for binding in bindings
        .iter_mut()
        .filter(|b| b.info.is_input() == input && b.info.data_type == DataType::Int8)
    {
        for byte in binding.host.as_bytes_mut() {
            *byte ^= 0x80;
        }
    }
}

/// Runs compiled plans on an accelerator
///
/// Every plan binding gets a host staging buffer and a device buffer of the same size. A
/// model given as `.onnx` is compiled once and the plan cached beside it as `.trt`; a model
/// given as a plan is loaded directly.
pub struct CompiledEngine {
    id: u64,
    state: State,
    runtime: Arc<dyn Runtime>,
    options: EngineOptions,
    pool: Option<ThreadPool>,
    executable: Option<Executable>,
    context: Option<ExecutionContext>,
    bindings: Vec<DeviceBinding>,
    /// Normalization per binding, set for bound inputs
    fused: Vec<Option<FusedNormalize>>,
    /// Bindings of the output descriptors, in descriptor order
    outputs: Vec<usize>,
    generation: u64,
}
impl CompiledEngine {
    pub fn with_runtime(runtime: Arc<dyn Runtime>, options: EngineOptions) -> Self {
        Self {
            id: next_engine_id(),
            state: State::Unconfigured,
            runtime,
            options,
            pool: None,
            executable: None,
            context: None,
            bindings: Vec::new(),
            fused: Vec::new(),
            outputs: Vec::new(),
            generation: 0,
        }
    }

    /// Executable for `model`
    ///
    /// A cached plan built at another precision than the one requested is rebuilt.
    fn load_executable(&self, model: &Path) -> Result<Executable> {
        let (plan, cached) = self.acquire_plan(model)?;
        let executable = self.runtime.deserialize_engine(&plan)?;
        if !cached || executable.precision() == self.options.precision {
            return Ok(executable);
        }

        warn!(
            "cached plan for {} is {:?} but {:?} was requested, rebuilding",
            model.display(),
            executable.precision(),
            self.options.precision
        );
        let plan = self.build_and_cache(model)?;
        Ok(self.runtime.deserialize_engine(&plan)?)
    }

    /// Serialized plan for `model`, building and caching it if needed
    ///
    /// The flag tells whether the plan came from the cache next to an `.onnx` model.
    fn acquire_plan(&self, model: &Path) -> Result<(Vec<u8>, bool)> {
        let extension = model
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        match extension.as_deref() {
            Some("onnx") => {
                let cached = model.with_extension(PLAN_EXTENSION);
                if cached.exists() {
                    info!("loading cached plan {}", cached.display());
                    return Ok((fs::read(&cached)?, true));
                }
                if !model.exists() {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("model {} doesn't exist", model.display()),
                    )));
                }

                Ok((self.build_and_cache(model)?, false))
            }
            Some(ext) if ext == PLAN_EXTENSION || ext == "plan" || ext == "engine" => {
                Ok((fs::read(model)?, false))
            }
            _ => Err(Error::Configuration(format!(
                "don't know how to load {}",
                model.display()
            ))),
        }
    }

    /// Build a plan for `model` and store it beside the model
    fn build_and_cache(&self, model: &Path) -> Result<Vec<u8>> {
        let cached = model.with_extension(PLAN_EXTENSION);
        let plan = self.build_plan(model)?;
        match fs::write(&cached, &plan) {
            Ok(()) => info!("cached plan as {}", cached.display()),
            Err(err) => warn!("failed to cache plan as {}: {err}", cached.display()),
        }
        Ok(plan)
    }

    fn build_plan(&self, model: &Path) -> Result<Vec<u8>> {
        let config = BuilderConfig {
            precision: self.options.precision,
            dla_core: self.options.dla_core,
            ..BuilderConfig::default()
        };
        if config.precision != Precision::Int8 {
            return Ok(self.runtime.build_serialized_network(model, &config, None)?);
        }

        let calibration = self.options.calibration.as_ref().ok_or_else(|| {
            Error::Configuration("int8 precision needs calibration settings".into())
        })?;
        let stream = BatchStream::new(
            &calibration.dir,
            &calibration.list_file,
            calibration.batch_size,
            calibration.nb_batches,
            [calibration.channels, calibration.height, calibration.width],
            calibration.scale,
            calibration.bias,
        )?;
        let mut calibrator = EntropyCalibrator::new(stream, &calibration.input_name).with_cache(
            model.with_extension(CALIBRATION_EXTENSION),
            calibration.read_cache,
        );

        Ok(self
            .runtime
            .build_serialized_network(model, &config, Some(&mut calibrator))?)
    }

    fn allocate_buffers(&mut self, bindings: &[BindingInfo]) -> Result<()> {
        for info in bindings {
            let tensor_type = tensor_type(info)?;
            let size = info
                .byte_size()
                .ok_or_else(|| Error::Allocation(format!("binding `{}` can't be staged", info.name)))?;

            let host = HostBuffer::zeroed(tensor_type, info.volume())?;
            let device = self.runtime.malloc(size)?;
            debug!(
                "binding {} `{}` ({:?}, {:?} {:?}): {size} bytes",
                self.bindings.len(),
                info.name,
                info.direction,
                info.data_type,
                info.dims
            );

            self.bindings.push(DeviceBinding {
                info: info.clone(),
                host,
                device,
            });
        }
        self.fused = vec![None; self.bindings.len()];

        Ok(())
    }

    fn bind(
        &mut self,
        model: &Path,
        inputs: &mut [InputTensorInfo],
        outputs: &mut [OutputTensorInfo],
    ) -> Result<()> {
        let executable = self.load_executable(model)?;
        let context = executable.create_execution_context()?;
        self.allocate_buffers(executable.bindings())?;

        let mut used = vec![false; self.bindings.len()];
        let mut resolve = |tensor: &mut TensorInfo, input: bool| -> Result<usize> {
            let index = executable
                .binding_index(&tensor.name)
                .ok_or_else(|| Error::TensorNotFound {
                    name: tensor.name.clone(),
                })?;
            let info = &self.bindings[index].info;
            if info.is_input() != input {
                return Err(Error::Configuration(format!(
                    "`{}` is an {} binding",
                    tensor.name,
                    if input { "output" } else { "input" }
                )));
            }
            if std::mem::replace(&mut used[index], true) {
                return Err(Error::Configuration(format!(
                    "`{}` is described twice",
                    tensor.name
                )));
            }

            let resolved = tensor_type(info)?;
            if tensor.tensor_type != TensorType::None && tensor.tensor_type != resolved {
                return Err(Error::Configuration(format!(
                    "`{}` is {} but the model uses {resolved}",
                    tensor.name, tensor.tensor_type
                )));
            }
            tensor.tensor_type = resolved;

            // Callers may describe inputs in their own layout as long as the volume matches
            if !input || tensor.shape.is_empty() {
                tensor.shape = info.dims.clone();
                tensor.layout = Layout::Nchw;
            } else if tensor.volume() != info.volume() {
                return Err(Error::Configuration(format!(
                    "`{}` has shape {:?} but the model uses {:?}",
                    tensor.name, tensor.shape, info.dims
                )));
            }

            if resolved == TensorType::Uint8 {
                tensor.quant = Quant {
                    scale: info.scale.unwrap_or(1.0),
                    zero_point: INT8_ZERO_POINT,
                };
            }
            tensor.check_quant()?;

            tensor.binding = Some(Binding {
                engine: self.id,
                slot: index,
                input,
            });
            Ok(index)
        };

        let mut fused = Vec::with_capacity(inputs.len());
        for input in inputs.iter_mut() {
            let index = resolve(&mut input.tensor, true)?;
            fused.push((index, input.normalize.fused()?));
        }
        let mut bound_outputs = Vec::with_capacity(outputs.len());
        for output in outputs.iter_mut() {
            bound_outputs.push(resolve(&mut output.tensor, false)?);
        }

        if let Some(missing) = self
            .bindings
            .iter()
            .zip(&used)
            .find(|(binding, used)| binding.info.is_input() && !**used)
        {
            return Err(Error::Configuration(format!(
                "input binding `{}` has no descriptor",
                missing.0.info.name
            )));
        }

        for (index, params) in fused {
            self.fused[index] = Some(params);
        }
        self.outputs = bound_outputs;
        self.executable = Some(executable);
        self.context = Some(context);

        Ok(())
    }

    /// Copy inputs in, run, and copy outputs back on one stream
    fn execute(&mut self) -> Result<()> {
        let context = self
            .context
            .as_mut()
            .ok_or_else(|| Error::Execution("no execution context".into()))?;
        let devices: Vec<DevicePtr> = self.bindings.iter().map(|b| b.device).collect();

        flip_int8(&mut self.bindings, true);
        let result = {
            let mut stream = Stream::new(self.runtime.as_ref());
            let (inputs, outputs): (Vec<_>, Vec<_>) = self
                .bindings
                .iter_mut()
                .partition(|binding| binding.info.is_input());

            for binding in inputs {
                let binding: &DeviceBinding = binding;
                stream.copy_htod_async(binding.device, binding.host.as_bytes());
            }
            stream.enqueue(context, &devices);
            for binding in outputs {
                let device = binding.device;
                stream.copy_dtoh_async(binding.host.as_bytes_mut(), device);
            }

            stream.synchronize()
        };
        // Staged inputs read the same before and after a run
        flip_int8(&mut self.bindings, true);
        result?;
        flip_int8(&mut self.bindings, false);

        Ok(())
    }

    fn release(&mut self) {
        self.context = None;
        self.executable = None;
        for binding in self.bindings.drain(..) {
            if let Err(err) = self.runtime.free(binding.device) {
                warn!("failed to free `{}`: {err}", binding.info.name);
            }
        }
        self.fused.clear();
        self.outputs.clear();
    }
}

impl Engine for CompiledEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Accelerator
    }

    fn state(&self) -> State {
        self.state
    }

    fn set_num_threads(&mut self, num_threads: usize) -> Result<()> {
        self.state.check(
            "set the thread count",
            &[
                State::Unconfigured,
                State::Initialized,
                State::Preprocessed,
                State::Invoked,
            ],
        )?;
        self.pool = Some(engine::thread_pool(num_threads)?);

        Ok(())
    }

    fn initialize(
        &mut self,
        model: &Path,
        inputs: &mut [InputTensorInfo],
        outputs: &mut [OutputTensorInfo],
    ) -> Result<()> {
        self.state.check("initialize", &[State::Unconfigured])?;

        match self.bind(model, inputs, outputs) {
            Ok(()) => {
                info!(
                    "loaded {} on {} with {} bindings",
                    model.display(),
                    self.runtime.device().name(),
                    self.bindings.len()
                );
                self.state = State::Initialized;
                Ok(())
            }
            Err(err) => {
                error!("failed to initialize {}: {err}", model.display());
                self.release();
                self.state = State::Failed;
                Err(err)
            }
        }
    }

    fn finalize(&mut self) -> Result<()> {
        if self.state == State::Finalized {
            return Err(Error::InvalidState {
                op: "finalize",
                state: self.state,
            });
        }

        self.release();
        self.state = State::Finalized;
        Ok(())
    }

    fn preprocess(&mut self, inputs: &[InputTensorInfo], frames: &[&[u8]]) -> Result<()> {
        self.state.check("preprocess", State::READY)?;
        engine::check_frames(inputs, frames)?;

        for (input, frame) in inputs.iter().zip(frames) {
            let binding = input.tensor.bound(self.id)?;
            let fused = self
                .fused
                .get(binding.slot)
                .copied()
                .flatten()
                .filter(|_| binding.input)
                .ok_or_else(|| {
                    Error::Configuration(format!("`{}` isn't a bound input", input.tensor.name))
                })?;
            let buffer = &mut self.bindings[binding.slot].host;

            engine::install(self.pool.as_ref(), || {
                preprocess::convert(input, &fused, frame, buffer)
            })?;
        }

        self.state = State::Preprocessed;
        Ok(())
    }

    fn invoke(&mut self, outputs: &mut [OutputTensorInfo]) -> Result<()> {
        self.state
            .check("invoke", &[State::Preprocessed, State::Invoked])?;

        if outputs.len() != self.outputs.len() {
            return Err(Error::OutputCountMismatch {
                expected: self.outputs.len(),
                actual: outputs.len(),
            });
        }
        let mut slots = Vec::with_capacity(outputs.len());
        for output in outputs.iter() {
            let binding = output.tensor.bound(self.id)?;
            if binding.input || !self.outputs.contains(&binding.slot) {
                return Err(Error::Configuration(format!(
                    "`{}` isn't a bound output",
                    output.tensor.name
                )));
            }
            slots.push(binding.slot);
        }

        if let Err(err) = self.execute() {
            error!("inference failed: {err}");
            self.state = State::Failed;
            return Err(err);
        }

        for (output, slot) in outputs.iter_mut().zip(slots) {
            output.tensor.shape = self.bindings[slot].info.dims.clone();
        }

        self.generation += 1;
        self.state = State::Invoked;
        Ok(())
    }

    fn tensor_data(&self, tensor: &TensorInfo) -> Result<TensorData<'_>> {
        self.state.check("read tensors", State::READY)?;

        let binding = tensor.bound(self.id)?;
        self.bindings
            .get(binding.slot)
            .map(|binding| binding.host.view())
            .ok_or_else(|| Error::Execution(format!("`{}` has no buffer", tensor.name)))
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}
impl Drop for CompiledEngine {
    fn drop(&mut self) {
        if !self.bindings.is_empty() {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::engine::CalibrationOptions;
    use crate::error::ErrorKind;
    use crate::tensor::{ImageRegion, SourceFormat};
    use crate::testing::{mock_runtime, mock_runtime_with, SIGNED_PATTERN};
    use accelrt::Direction;

    fn model_dir() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.onnx");
        fs::write(&model, b"mock model").unwrap();
        (dir, model)
    }

    fn input() -> InputTensorInfo {
        let mut input = InputTensorInfo::new("data");
        input.source = SourceFormat::ImageRgb;
        input.image = ImageRegion::full(2, 2, 3);
        input
    }

    fn outputs(n: usize) -> Vec<OutputTensorInfo> {
        let mut outputs = vec![OutputTensorInfo::new("prob")];
        outputs.extend((1..n).map(|i| OutputTensorInfo::new(format!("aux{i}"))));
        outputs
    }

    #[test]
    fn full_round_trip() {
        let (_dir, model) = model_dir();
        let (runtime, _) = mock_runtime(2, 1 << 20);
        let mut engine = CompiledEngine::with_runtime(runtime.clone(), EngineOptions::default());

        let mut inputs = [input()];
        let mut outputs = outputs(2);
        engine.initialize(&model, &mut inputs, &mut outputs).unwrap();

        // Descriptors are completed from the plan
        assert_eq!(inputs[0].tensor.tensor_type, TensorType::Fp32);
        assert_eq!(inputs[0].tensor.shape, [1, 3, 2, 2]);
        assert_eq!(outputs[1].tensor.tensor_type, TensorType::Uint8);
        assert_eq!(outputs[1].tensor.quant.scale, 2.0);
        assert!(model.with_extension(PLAN_EXTENSION).exists());

        engine.preprocess(&inputs, &[&[0u8; 12]]).unwrap();
        engine.invoke(&mut outputs).unwrap();
        assert_eq!(outputs[0].float_view(&engine).unwrap(), [0.0, 0.0]);
        assert_eq!(
            outputs[1].float_view(&engine).unwrap(),
            [20.0, 24.0, 28.0, 32.0]
        );

        // Dequantized values follow the next invocation
        engine.preprocess(&inputs, &[&[255u8; 12]]).unwrap();
        engine.invoke(&mut outputs).unwrap();
        assert_eq!(outputs[0].float_view(&engine).unwrap(), [12.0, 1.0]);
        assert_eq!(
            outputs[1].float_view(&engine).unwrap(),
            [44.0, 48.0, 52.0, 56.0]
        );
        assert_eq!(engine.generation(), 2);

        engine.finalize().unwrap();
        assert_eq!(runtime.memory_stats().live(), 0);
    }

    #[test]
    fn plans_are_built_once() {
        let (_dir, model) = model_dir();
        let (runtime, compiles) = mock_runtime(1, 1 << 20);

        for path in [model.clone(), model.clone(), model.with_extension(PLAN_EXTENSION)] {
            let mut engine =
                CompiledEngine::with_runtime(runtime.clone(), EngineOptions::default());
            engine
                .initialize(&path, &mut [input()], &mut outputs(1))
                .unwrap();
            engine.finalize().unwrap();
        }

        assert_eq!(compiles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_allocation_is_freed() {
        for n in 1..=4 {
            let (_dir, model) = model_dir();
            let (runtime, _) = mock_runtime(n, 1 << 20);

            let mut engine =
                CompiledEngine::with_runtime(runtime.clone(), EngineOptions::default());
            let mut outputs = outputs(n);
            engine
                .initialize(&model, &mut [input()], &mut outputs)
                .unwrap();
            let stats = runtime.memory_stats();
            assert_eq!(stats.allocations, n as u64 + 1);
            assert_eq!(stats.live(), n as u64 + 1);

            engine.finalize().unwrap();
            let stats = runtime.memory_stats();
            assert_eq!(stats.frees, stats.allocations);
            assert_eq!(stats.bytes_in_use, 0);

            // Dropping an engine that was never finalized frees too
            let mut engine =
                CompiledEngine::with_runtime(runtime.clone(), EngineOptions::default());
            engine
                .initialize(&model, &mut [input()], &mut outputs)
                .unwrap();
            drop(engine);
            assert_eq!(runtime.memory_stats().live(), 0);
        }
    }

    #[test]
    fn failed_allocation_releases_earlier_buffers() {
        let (_dir, model) = model_dir();
        // Room for the 48 byte input but not the 8 byte output
        let (runtime, _) = mock_runtime(1, 50);
        let mut engine = CompiledEngine::with_runtime(runtime.clone(), EngineOptions::default());

        let err = engine
            .initialize(&model, &mut [input()], &mut outputs(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Allocation);
        assert_eq!(engine.state(), State::Failed);
        assert_eq!(runtime.memory_stats().live(), 0);
    }

    #[test]
    fn unknown_output_is_rejected() {
        let (_dir, model) = model_dir();
        let (runtime, _) = mock_runtime(1, 1 << 20);
        let mut engine = CompiledEngine::with_runtime(runtime.clone(), EngineOptions::default());

        let mut inputs = [input()];
        let mut outputs = [OutputTensorInfo::new("softmax")];
        let err = engine
            .initialize(&model, &mut inputs, &mut outputs)
            .unwrap_err();
        assert!(matches!(err, Error::TensorNotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(runtime.memory_stats().live(), 0);

        assert!(matches!(
            engine.invoke(&mut outputs),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn every_input_needs_a_descriptor() {
        let (_dir, model) = model_dir();
        let (runtime, _) = mock_runtime(1, 1 << 20);
        let mut engine = CompiledEngine::with_runtime(runtime, EngineOptions::default());

        let err = engine
            .initialize(&model, &mut [], &mut outputs(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn mismatched_descriptors_are_rejected() {
        let (_dir, model) = model_dir();
        let (runtime, _) = mock_runtime(1, 1 << 20);

        let mut wrong_type = input();
        wrong_type.tensor.tensor_type = TensorType::Uint8;
        let mut wrong_shape = input();
        wrong_shape.tensor.shape = vec![1, 3, 4, 4];

        for input in [wrong_type, wrong_shape] {
            let mut engine =
                CompiledEngine::with_runtime(runtime.clone(), EngineOptions::default());
            let err = engine
                .initialize(&model, &mut [input], &mut outputs(1))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration);
        }
    }

    #[test]
    fn unknown_model_formats() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.tflite");
        fs::write(&model, b"mock model").unwrap();
        let (runtime, _) = mock_runtime(1, 1 << 20);
        let mut engine = CompiledEngine::with_runtime(runtime, EngineOptions::default());

        let err = engine
            .initialize(&model, &mut [input()], &mut outputs(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn missing_model_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _) = mock_runtime(1, 1 << 20);
        let mut engine = CompiledEngine::with_runtime(runtime, EngineOptions::default());

        let err = engine
            .initialize(
                &dir.path().join("missing.onnx"),
                &mut [input()],
                &mut outputs(1),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn output_count_is_checked_before_running() {
        let (_dir, model) = model_dir();
        let (runtime, _) = mock_runtime(2, 1 << 20);
        let mut engine = CompiledEngine::with_runtime(runtime, EngineOptions::default());

        let mut inputs = [input()];
        let mut outputs = outputs(2);
        engine.initialize(&model, &mut inputs, &mut outputs).unwrap();
        engine.preprocess(&inputs, &[&[0u8; 12]]).unwrap();

        assert!(matches!(
            engine.invoke(&mut outputs[1..]),
            Err(Error::OutputCountMismatch {
                expected: 2,
                actual: 1
            })
        ));
        assert_eq!(engine.generation(), 0);
        assert_eq!(engine.state(), State::Preprocessed);
    }

    #[test]
    fn int8_needs_calibration_settings() {
        let (_dir, model) = model_dir();
        let (runtime, _) = mock_runtime(1, 1 << 20);
        let options = EngineOptions {
            precision: Precision::Int8,
            ..EngineOptions::default()
        };
        let mut engine = CompiledEngine::with_runtime(runtime, options);

        let err = engine
            .initialize(&model, &mut [input()], &mut outputs(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    /// Int8 options over four small images written into `dir`
    fn int8_options(dir: &Path) -> EngineOptions {
        let images = dir.join("calibration");
        fs::create_dir(&images).unwrap();
        let mut list = String::new();
        for i in 0..4u8 {
            let name = format!("{i}.png");
            image::RgbImage::from_pixel(4, 4, image::Rgb([i * 50, 100, 200]))
                .save(images.join(&name))
                .unwrap();
            list.push_str(&name);
            list.push('\n');
        }
        fs::write(images.join("list.txt"), list).unwrap();

        EngineOptions {
            precision: Precision::Int8,
            calibration: Some(CalibrationOptions {
                dir: images,
                batch_size: 2,
                height: 4,
                width: 4,
                ..CalibrationOptions::default()
            }),
            ..EngineOptions::default()
        }
    }

    fn int8_binding(name: &str, direction: Direction, scale: f32) -> BindingInfo {
        BindingInfo {
            name: name.into(),
            direction,
            dims: vec![1, 4],
            data_type: DataType::Int8,
            scale: Some(scale),
        }
    }

    #[test]
    fn int8_builds_cache_their_calibration() {
        let (dir, model) = model_dir();
        let (runtime, _) = mock_runtime(1, 1 << 20);
        let mut engine = CompiledEngine::with_runtime(runtime, int8_options(dir.path()));
        engine
            .initialize(&model, &mut [input()], &mut outputs(1))
            .unwrap();

        assert!(model.with_extension(CALIBRATION_EXTENSION).exists());
        assert!(model.with_extension(PLAN_EXTENSION).exists());
    }

    #[test]
    fn cached_plans_at_another_precision_are_rebuilt() {
        let (dir, model) = model_dir();
        let (runtime, compiles) = mock_runtime(1, 1 << 20);
        let int8 = int8_options(dir.path());

        for options in [int8.clone(), EngineOptions::default(), EngineOptions::default(), int8] {
            let mut engine = CompiledEngine::with_runtime(runtime.clone(), options);
            engine
                .initialize(&model, &mut [input()], &mut outputs(1))
                .unwrap();
            engine.finalize().unwrap();
        }

        // int8, rebuilt as fp32, reused, rebuilt as int8
        assert_eq!(compiles.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn corrupt_cached_plan_fails_execution() {
        let (_dir, model) = model_dir();
        fs::write(model.with_extension(PLAN_EXTENSION), b"not a plan at all").unwrap();
        let (runtime, compiles) = mock_runtime(1, 1 << 20);
        let mut engine = CompiledEngine::with_runtime(runtime.clone(), EngineOptions::default());

        let err = engine
            .initialize(&model, &mut [input()], &mut outputs(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert_eq!(engine.state(), State::Failed);
        assert_eq!(compiles.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.memory_stats().live(), 0);
    }

    #[test]
    fn unstageable_bindings_fail_allocation() {
        let (_dir, model) = model_dir();
        let flags = BindingInfo {
            name: "flags".into(),
            direction: Direction::Output,
            dims: vec![1, 4],
            data_type: DataType::Bool,
            scale: None,
        };
        let (runtime, _) = mock_runtime_with(1, 1 << 20, vec![flags]);
        let mut engine = CompiledEngine::with_runtime(runtime.clone(), EngineOptions::default());

        let err = engine
            .initialize(&model, &mut [input()], &mut outputs(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Allocation);
        assert_eq!(engine.state(), State::Failed);
        assert_eq!(runtime.memory_stats().live(), 0);
    }

    #[test]
    fn negative_int8_outputs_dequantize_signed() {
        let (_dir, model) = model_dir();
        let (runtime, _) = mock_runtime_with(
            1,
            1 << 20,
            vec![int8_binding("signed", Direction::Output, 1.0)],
        );
        let mut engine = CompiledEngine::with_runtime(runtime, EngineOptions::default());

        let mut inputs = [input()];
        let mut outputs = outputs(1);
        outputs.push(OutputTensorInfo::new("signed"));
        engine.initialize(&model, &mut inputs, &mut outputs).unwrap();
        assert_eq!(outputs[1].tensor.quant.zero_point, 128);

        engine.preprocess(&inputs, &[&[0u8; 12]]).unwrap();
        engine.invoke(&mut outputs).unwrap();

        let expected: Vec<f32> = SIGNED_PATTERN.iter().map(|q| *q as f32).collect();
        assert_eq!(outputs[1].float_view(&engine).unwrap(), expected.as_slice());
    }

    #[test]
    fn int8_inputs_reach_the_device_signed() {
        let (_dir, model) = model_dir();
        let (runtime, _) = mock_runtime_with(
            1,
            1 << 20,
            vec![
                int8_binding("mask", Direction::Input, 0.5),
                int8_binding("echo", Direction::Output, 0.5),
            ],
        );
        let mut engine = CompiledEngine::with_runtime(runtime, EngineOptions::default());

        let mut mask = InputTensorInfo::new("mask");
        mask.source = SourceFormat::BlobNchw;
        let mut inputs = [input(), mask];
        let mut outputs = outputs(1);
        outputs.push(OutputTensorInfo::new("echo"));
        engine.initialize(&model, &mut inputs, &mut outputs).unwrap();
        assert_eq!(inputs[1].tensor.tensor_type, TensorType::Uint8);

        // -1.0, 0.0, 1.0 and 63.5 at scale 0.5
        let blob = [126u8, 128, 130, 255];
        engine.preprocess(&inputs, &[&[0u8; 12], &blob]).unwrap();
        engine.invoke(&mut outputs).unwrap();

        assert_eq!(
            outputs[1].float_view(&engine).unwrap(),
            [-1.0, 0.0, 1.0, 63.5]
        );
        // The staged input is untouched by the run
        assert_eq!(
            engine.tensor_data(&inputs[1].tensor).unwrap(),
            TensorData::U8(&blob)
        );
    }
}
