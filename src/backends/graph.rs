use std::path::Path;

use rayon::ThreadPool;

use crate::buffer::{HostBuffer, TensorData};
use crate::engine::{self, Engine, EngineKind, State};
use crate::error::{Error, Result};
use crate::net::{Blob, Net};
use crate::preprocess;
use crate::tensor::{
    next_engine_id, Binding, Dims, FusedNormalize, InputTensorInfo, Layout, OutputTensorInfo,
    Quant, TensorInfo, TensorType,
};

/// Opens a model file as a [Net]
pub type NetLoader = Box<dyn Fn(&Path) -> Result<Box<dyn Net>> + Send>;

struct GraphInput {
    /// Name of the graph input this feeds
    name: String,
    buffer: HostBuffer,
    dims: Dims,
    layout: Layout,
    fused: FusedNormalize,
}

/// Runs models through a graph executor on the CPU
///
/// Inputs are staged on the host and handed to the graph as float NCHW blobs. Outputs are
/// whatever layers the output descriptors name, always as floats.
pub struct GraphEngine {
    id: u64,
    state: State,
    loader: NetLoader,
    pool: Option<ThreadPool>,
    net: Option<Box<dyn Net>>,
    inputs: Vec<GraphInput>,
    outputs: Vec<String>,
    results: Vec<Blob>,
    generation: u64,
}
impl GraphEngine {
    /// Create an engine that loads ONNX models
    #[cfg(feature = "onnx")]
    pub fn new() -> Result<Self> {
        Ok(Self::with_loader(Box::new(|path: &Path| {
            Ok(Box::new(crate::net::TractNet::load(path)?) as Box<dyn Net>)
        })))
    }

    #[cfg(not(feature = "onnx"))]
    pub fn new() -> Result<Self> {
        Err(Error::Configuration(
            "the CPU executor needs the `onnx` feature".into(),
        ))
    }

    /// Create an engine that opens models with `loader`
    pub fn with_loader(loader: NetLoader) -> Self {
        Self {
            id: next_engine_id(),
            state: State::Unconfigured,
            loader,
            pool: None,
            net: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            results: Vec::new(),
            generation: 0,
        }
    }

    fn bind(
        &mut self,
        model: &Path,
        inputs: &mut [InputTensorInfo],
        outputs: &mut [OutputTensorInfo],
    ) -> Result<()> {
        if !model.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("model {} doesn't exist", model.display()),
            )));
        }
        if inputs.is_empty() {
            return Err(Error::Configuration("at least one input is required".into()));
        }

        let net = (self.loader)(model)?;

        // A lone input feeds the lone graph input whatever it's called
        let graph_inputs = net.input_names();
        let positional = inputs.len() == 1 && graph_inputs.len() == 1;

        let mut used = vec![false; graph_inputs.len()];
        for (slot, input) in inputs.iter_mut().enumerate() {
            let tensor = &mut input.tensor;
            let index = if positional {
                if graph_inputs[0] != tensor.name {
                    debug!("feeding `{}` to graph input `{}`", tensor.name, graph_inputs[0]);
                }
                0
            } else {
                graph_inputs
                    .iter()
                    .position(|name| *name == tensor.name)
                    .ok_or_else(|| Error::TensorNotFound {
                        name: tensor.name.clone(),
                    })?
            };
            if std::mem::replace(&mut used[index], true) {
                return Err(Error::Configuration(format!(
                    "graph input `{}` is described twice",
                    graph_inputs[index]
                )));
            }
            let name = graph_inputs[index].clone();
            tensor.name = name.clone();

            if !matches!(tensor.tensor_type, TensorType::Fp32 | TensorType::Uint8) {
                return Err(Error::unsupported(tensor.tensor_type, "graph input"));
            }
            let dims = tensor
                .dims()
                .filter(|dims| !tensor.shape.is_empty() && dims.volume() > 0)
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "`{}` needs a shape, got {:?}",
                        tensor.name, tensor.shape
                    ))
                })?;

            let fused = input.normalize.fused()?;
            let buffer = HostBuffer::zeroed(tensor.tensor_type, dims.volume())?;
            tensor.binding = Some(Binding {
                engine: self.id,
                slot,
                input: true,
            });

            self.inputs.push(GraphInput {
                name,
                buffer,
                dims,
                layout: tensor.layout,
                fused,
            });
        }

        if let Some(missing) = graph_inputs.iter().zip(&used).find(|(_, used)| !**used) {
            return Err(Error::Configuration(format!(
                "graph input `{}` has no descriptor",
                missing.0
            )));
        }

        let layers = net.layer_names();
        for (slot, output) in outputs.iter_mut().enumerate() {
            let tensor = &mut output.tensor;
            if !layers.contains(&tensor.name) {
                return Err(Error::TensorNotFound {
                    name: tensor.name.clone(),
                });
            }
            if self.outputs.contains(&tensor.name) {
                return Err(Error::Configuration(format!(
                    "output `{}` is listed twice",
                    tensor.name
                )));
            }

            tensor.tensor_type = TensorType::Fp32;
            tensor.layout = Layout::Nchw;
            tensor.quant = Quant::default();
            tensor.binding = Some(Binding {
                engine: self.id,
                slot,
                input: false,
            });
            self.outputs.push(tensor.name.clone());
        }

        self.net = Some(net);
        Ok(())
    }

    fn release(&mut self) {
        self.net = None;
        self.inputs.clear();
        self.outputs.clear();
        self.results.clear();
    }
}

/// Float NCHW blob of a staged input
fn to_blob(input: &GraphInput) -> Blob {
    let values: Vec<f32> = match &input.buffer {
        HostBuffer::F32(values) => values.clone(),
        HostBuffer::U8(values) => values.iter().map(|v| *v as f32).collect(),
        HostBuffer::I32(values) => values.iter().map(|v| *v as f32).collect(),
        HostBuffer::I64(values) => values.iter().map(|v| *v as f32).collect(),
    };

    let dims = input.dims;
    let data = match input.layout {
        Layout::Nchw => values,
        Layout::Nhwc => {
            let mut planar = vec![0.0f32; values.len()];
            preprocess::transpose(
                bytemuck::cast_slice(&values),
                bytemuck::cast_slice_mut(&mut planar),
                Layout::Nhwc,
                dims,
                std::mem::size_of::<f32>(),
            );
            planar
        }
    };

    Blob {
        shape: vec![dims.batch, dims.channel, dims.height, dims.width],
        data: HostBuffer::F32(data),
    }
}

impl Engine for GraphEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Cpu
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
        debug!("using {num_threads} threads");

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
                    "loaded {} with {} inputs and {} outputs",
                    model.display(),
                    inputs.len(),
                    outputs.len()
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
            let staged = self
                .inputs
                .get_mut(binding.slot)
                .filter(|_| binding.input)
                .ok_or_else(|| {
                    Error::Configuration(format!("`{}` isn't an input", input.tensor.name))
                })?;

            let GraphInput { buffer, fused, .. } = staged;
            engine::install(self.pool.as_ref(), || {
                preprocess::convert(input, fused, frame, buffer)
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
            if binding.input {
                return Err(Error::Configuration(format!(
                    "`{}` is an input",
                    output.tensor.name
                )));
            }
            slots.push(binding.slot);
        }

        let net = self
            .net
            .as_mut()
            .ok_or_else(|| Error::Execution("no model loaded".into()))?;
        for input in &self.inputs {
            net.set_input(&input.name, to_blob(input))?;
        }

        let names = &self.outputs;
        let blobs = match engine::install(self.pool.as_ref(), || net.forward(names)) {
            Ok(blobs) if blobs.len() == names.len() => blobs,
            Ok(blobs) => {
                self.state = State::Failed;
                return Err(Error::OutputCountMismatch {
                    expected: names.len(),
                    actual: blobs.len(),
                });
            }
            Err(err) => {
                error!("forward pass failed: {err}");
                self.state = State::Failed;
                return Err(err);
            }
        };

        for (output, slot) in outputs.iter_mut().zip(slots) {
            let blob = &blobs[slot];
            output.tensor.shape = blob.shape.clone();
            output.tensor.tensor_type = blob.data.tensor_type();
        }

        self.results = blobs;
        self.generation += 1;
        self.state = State::Invoked;
        Ok(())
    }

    fn tensor_data(&self, tensor: &TensorInfo) -> Result<TensorData<'_>> {
        self.state.check("read tensors", State::READY)?;

        let binding = tensor.bound(self.id)?;
        let data = if binding.input {
            self.inputs.get(binding.slot).map(|input| input.buffer.view())
        } else {
            self.results.get(binding.slot).map(|blob| blob.data.view())
        };

        data.ok_or_else(|| Error::Execution(format!("`{}` has no data yet", tensor.name)))
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tensor::{ImageRegion, SourceFormat};
    use crate::testing::MockNet;

    fn input() -> InputTensorInfo {
        let mut input = InputTensorInfo::new("image");
        input.tensor.tensor_type = TensorType::Fp32;
        input.tensor.shape = vec![1, 3, 2, 2];
        input.source = SourceFormat::ImageRgb;
        input.image = ImageRegion::full(2, 2, 3);
        input
    }

    fn model() -> tempfile::NamedTempFile {
        tempfile::NamedTempFile::new().unwrap()
    }

    #[test]
    fn runs_requested_layers() {
        let model = model();
        let mut engine = GraphEngine::with_loader(MockNet::loader());
        let mut inputs = [input()];
        let mut outputs = [OutputTensorInfo::new("prob"), OutputTensorInfo::new("conv1")];

        engine
            .initialize(model.path(), &mut inputs, &mut outputs)
            .unwrap();
        assert_eq!(engine.state(), State::Initialized);
        // The lone input is renamed after the graph input it feeds
        assert_eq!(inputs[0].tensor.name, "data");

        let frame = [255u8; 12];
        engine.preprocess(&inputs, &[&frame]).unwrap();
        engine.invoke(&mut outputs).unwrap();
        assert_eq!(engine.generation(), 1);

        // Every input element is 1.0 after normalization
        assert_eq!(outputs[0].tensor.shape, [1, 2]);
        assert_eq!(outputs[0].float_view(&engine).unwrap(), [12.0, 1.0]);
        assert_eq!(outputs[1].tensor.shape, [1, 3, 2, 2]);
        assert_eq!(outputs[1].float_view(&engine).unwrap(), [1.0; 12]);

        engine.finalize().unwrap();
        assert_eq!(engine.state(), State::Finalized);
        assert!(engine.finalize().is_err());
    }

    #[test]
    fn float_views_borrow_engine_memory() {
        let model = model();
        let mut engine = GraphEngine::with_loader(MockNet::loader());
        let mut inputs = [input()];
        let mut outputs = [OutputTensorInfo::new("prob")];
        engine
            .initialize(model.path(), &mut inputs, &mut outputs)
            .unwrap();
        engine.preprocess(&inputs, &[&[0u8; 12]]).unwrap();
        engine.invoke(&mut outputs).unwrap();

        let TensorData::F32(raw) = engine.tensor_data(&outputs[0].tensor).unwrap() else {
            panic!("expected float output");
        };
        let raw = raw.as_ptr();
        let view = outputs[0].float_view(&engine).unwrap();
        assert_eq!(view.as_ptr(), raw);
    }

    #[test]
    fn nhwc_inputs_reach_the_graph_planar() {
        let model = model();
        let mut engine = GraphEngine::with_loader(MockNet::loader());
        let mut input = input();
        input.tensor.tensor_type = TensorType::Uint8;
        input.tensor.layout = Layout::Nhwc;
        input.tensor.shape = vec![1, 2, 2, 3];
        let mut inputs = [input];
        let mut outputs = [OutputTensorInfo::new("conv1")];

        engine
            .initialize(model.path(), &mut inputs, &mut outputs)
            .unwrap();
        let frame: Vec<u8> = (0..12).collect();
        engine.preprocess(&inputs, &[&frame]).unwrap();
        engine.invoke(&mut outputs).unwrap();

        assert_eq!(
            outputs[0].float_view(&engine).unwrap(),
            [0.0, 3.0, 6.0, 9.0, 1.0, 4.0, 7.0, 10.0, 2.0, 5.0, 8.0, 11.0]
        );
    }

    #[test]
    fn unknown_output_fails_initialization() {
        let model = model();
        let mut engine = GraphEngine::with_loader(MockNet::loader());
        let mut inputs = [input()];
        let mut outputs = [OutputTensorInfo::new("softmax")];

        let err = engine
            .initialize(model.path(), &mut inputs, &mut outputs)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(engine.state(), State::Failed);

        let err = engine.invoke(&mut outputs).unwrap_err();
        assert!(matches!(err, Error::InvalidState { op: "invoke", .. }));
        engine.finalize().unwrap();
    }

    #[test]
    fn graph_inputs_are_described_once() {
        let model = model();
        let mut engine = GraphEngine::with_loader(MockNet::loader());
        let mut first = input();
        first.tensor.name = "data".into();
        let second = first.clone();

        let err = engine
            .initialize(
                model.path(),
                &mut [first, second],
                &mut [OutputTensorInfo::new("prob")],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(engine.state(), State::Failed);
    }

    #[test]
    fn every_graph_input_needs_a_descriptor() {
        let model = model();
        let mut engine = GraphEngine::with_loader(MockNet::loader_with_inputs(&["mask"]));
        let mut input = input();
        input.tensor.name = "data".into();

        let err = engine
            .initialize(
                model.path(),
                &mut [input],
                &mut [OutputTensorInfo::new("prob")],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("mask"));
        assert_eq!(engine.state(), State::Failed);
    }

    #[test]
    fn missing_model_is_an_io_error() {
        let mut engine = GraphEngine::with_loader(MockNet::loader());
        let err = engine
            .initialize(
                Path::new("/nonexistent/model.onnx"),
                &mut [input()],
                &mut [OutputTensorInfo::new("prob")],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn output_count_is_checked() {
        let model = model();
        let mut engine = GraphEngine::with_loader(MockNet::loader());
        let mut inputs = [input()];
        let mut outputs = [OutputTensorInfo::new("prob"), OutputTensorInfo::new("conv1")];
        engine
            .initialize(model.path(), &mut inputs, &mut outputs)
            .unwrap();
        engine.preprocess(&inputs, &[&[0u8; 12]]).unwrap();

        let err = engine.invoke(&mut outputs[..1]).unwrap_err();
        assert!(matches!(
            err,
            Error::OutputCountMismatch {
                expected: 2,
                actual: 1
            }
        ));
        // Nothing ran, so the engine is still usable
        engine.invoke(&mut outputs).unwrap();
    }

    #[test]
    fn short_forward_pass_fails_invoke() {
        let model = model();
        let mut engine = GraphEngine::with_loader(MockNet::truncating_loader());
        let mut inputs = [input()];
        let mut outputs = [OutputTensorInfo::new("prob"), OutputTensorInfo::new("conv1")];
        engine
            .initialize(model.path(), &mut inputs, &mut outputs)
            .unwrap();
        engine.preprocess(&inputs, &[&[0u8; 12]]).unwrap();

        let err = engine.invoke(&mut outputs).unwrap_err();
        assert!(matches!(err, Error::OutputCountMismatch { .. }));
        assert_eq!(engine.state(), State::Failed);
    }

    #[test]
    fn invoke_needs_preprocessed_inputs() {
        let model = model();
        let mut engine = GraphEngine::with_loader(MockNet::loader());
        let mut inputs = [input()];
        let mut outputs = [OutputTensorInfo::new("prob")];
        engine
            .initialize(model.path(), &mut inputs, &mut outputs)
            .unwrap();

        assert_eq!(
            engine.invoke(&mut outputs).unwrap_err().kind(),
            ErrorKind::Execution
        );
        // Initialized engines don't have results yet
        assert!(outputs[0].float_view(&engine).is_err());
    }
}
