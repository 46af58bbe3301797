//! Test doubles for the backends

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use accelrt::{
    BindingInfo, BuilderConfig, DataType, DeviceInfo, DeviceKind, Direction, HostRuntime,
    Int8Calibrator, Kernel, Network, NetworkCompiler, Plan, PlanHeader, Precision,
};

use crate::backends::NetLoader;
use crate::buffer::HostBuffer;
use crate::error::{Error, Result};
use crate::net::{Blob, Net};

/// Graph with input `data` and layers `conv1` (a copy of the input) and `prob` (sum and max)
///
/// Extra inputs are accepted and ignored by the layers.
pub(crate) struct MockNet {
    inputs: Vec<String>,
    layers: Vec<String>,
    input: Option<Blob>,
    truncate: bool,
}
impl MockNet {
    fn new(extra_inputs: &[&str], truncate: bool) -> Self {
        let mut inputs = vec!["data".to_string()];
        inputs.extend(extra_inputs.iter().map(|name| name.to_string()));
        let mut layers = inputs.clone();
        layers.extend(["conv1".to_string(), "prob".to_string()]);

        Self {
            inputs,
            layers,
            input: None,
            truncate,
        }
    }

    pub fn loader() -> NetLoader {
        Box::new(|_: &Path| Ok(Box::new(MockNet::new(&[], false)) as Box<dyn Net>))
    }

    /// Loader for a net with graph inputs `data` and `extra_inputs`
    pub fn loader_with_inputs(extra_inputs: &'static [&'static str]) -> NetLoader {
        Box::new(move |_: &Path| Ok(Box::new(MockNet::new(extra_inputs, false)) as Box<dyn Net>))
    }

    /// Loader for a net that returns only the first requested output
    pub fn truncating_loader() -> NetLoader {
        Box::new(|_: &Path| Ok(Box::new(MockNet::new(&[], true)) as Box<dyn Net>))
    }
}
impl Net for MockNet {
    fn input_names(&self) -> &[String] {
        &self.inputs
    }

    fn layer_names(&self) -> &[String] {
        &self.layers
    }

    fn set_input(&mut self, name: &str, blob: Blob) -> Result<()> {
        if !self.inputs.iter().any(|input| input == name) {
            return Err(Error::TensorNotFound { name: name.into() });
        }
        if name == "data" {
            self.input = Some(blob);
        }
        Ok(())
    }

    fn forward(&mut self, outputs: &[String]) -> Result<Vec<Blob>> {
        let input = self
            .input
            .clone()
            .ok_or_else(|| Error::Execution("no input".into()))?;
        let HostBuffer::F32(values) = &input.data else {
            return Err(Error::Execution("float input expected".into()));
        };
        let sum: f32 = values.iter().sum();
        let max = values.iter().copied().fold(f32::MIN, f32::max);

        let mut blobs = Vec::new();
        for name in outputs {
            blobs.push(match name.as_str() {
                "data" | "conv1" => input.clone(),
                "prob" => Blob {
                    shape: vec![1, 2],
                    data: HostBuffer::F32(vec![sum, max]),
                },
                _ => return Err(Error::TensorNotFound { name: name.clone() }),
            });
        }
        if self.truncate {
            blobs.truncate(1);
        }

        Ok(blobs)
    }
}

/// Signed bytes written to extra int8 outputs when the plan has no extra input
pub(crate) const SIGNED_PATTERN: [i8; 4] = [-1, -128, 127, 0];

/// Compiles any existing file into a plan with input `data` (float 1x3x2x2), output `prob`
/// (float, sum and max of the input) and `aux1..auxN` (int8 with scale 2)
///
/// `extra` bindings are appended after those. Extra outputs receive a copy of the last extra
/// input, or [SIGNED_PATTERN] if there is none.
pub(crate) struct MockCompiler {
    outputs: usize,
    extra: Vec<BindingInfo>,
    compiles: Arc<AtomicUsize>,
}

struct MockKernel {
    aux: usize,
}
impl Kernel for MockKernel {
    fn forward(
        &mut self,
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
    ) -> Result<(), accelrt::Error> {
        let values: Vec<f32> = inputs[0]
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let sum: f32 = values.iter().sum();
        let max = values.iter().copied().fold(f32::MIN, f32::max);

        let (prob, rest) = outputs.split_at_mut(1);
        prob[0][..4].copy_from_slice(&sum.to_ne_bytes());
        prob[0][4..].copy_from_slice(&max.to_ne_bytes());

        let (aux, extra) = rest.split_at_mut(self.aux);
        for out in aux {
            for (q, base) in out.iter_mut().zip([10u8, 12, 14, 16]) {
                *q = base + sum.round() as u8;
            }
        }
        for out in extra {
            match inputs.get(1..).and_then(|extra| extra.last()) {
                Some(echo) => out.copy_from_slice(echo),
                None => {
                    for (q, value) in out.iter_mut().zip(SIGNED_PATTERN.iter().cycle()) {
                        *q = *value as u8;
                    }
                }
            }
        }

        Ok(())
    }
}

struct MockNetwork {
    aux: usize,
}
impl Network for MockNetwork {
    fn instantiate(&self) -> Result<Box<dyn Kernel>, accelrt::Error> {
        Ok(Box::new(MockKernel { aux: self.aux }))
    }
}

impl NetworkCompiler for MockCompiler {
    fn name(&self) -> &str {
        "mock"
    }

    fn compile(
        &self,
        model: &Path,
        config: &BuilderConfig,
        calibrator: Option<&mut dyn Int8Calibrator>,
    ) -> Result<Plan, accelrt::Error> {
        std::fs::metadata(model)?;
        self.compiles.fetch_add(1, Ordering::SeqCst);

        let mut bindings = vec![
            BindingInfo {
                name: "data".into(),
                direction: Direction::Input,
                dims: vec![1, 3, 2, 2],
                data_type: DataType::Float,
                scale: None,
            },
            BindingInfo {
                name: "prob".into(),
                direction: Direction::Output,
                dims: vec![1, 2],
                data_type: DataType::Float,
                scale: None,
            },
        ];
        for i in 1..self.outputs {
            bindings.push(BindingInfo {
                name: format!("aux{i}"),
                direction: Direction::Output,
                dims: vec![1, 4],
                data_type: DataType::Int8,
                scale: Some(2.0),
            });
        }
        bindings.extend(self.extra.iter().cloned());

        let calibration = match (config.precision, calibrator) {
            (Precision::Int8, Some(calibrator)) => Some(accelrt::calibrate(calibrator)?),
            _ => None,
        };

        Ok(Plan {
            header: PlanHeader {
                producer: self.name().into(),
                precision: config.precision,
                bindings,
                calibration,
            },
            network: Vec::new(),
        })
    }

    fn load(&self, _plan: &Plan) -> Result<Box<dyn Network>, accelrt::Error> {
        Ok(Box::new(MockNetwork {
            aux: self.outputs.saturating_sub(1),
        }))
    }
}

/// Host runtime with `outputs` output bindings and `memory_limit` bytes of device memory,
/// plus a counter of plan builds
pub(crate) fn mock_runtime(outputs: usize, memory_limit: u64) -> (Arc<HostRuntime>, Arc<AtomicUsize>) {
    mock_runtime_with(outputs, memory_limit, Vec::new())
}

/// [mock_runtime] with `extra` bindings appended to the plan
pub(crate) fn mock_runtime_with(
    outputs: usize,
    memory_limit: u64,
    extra: Vec<BindingInfo>,
) -> (Arc<HostRuntime>, Arc<AtomicUsize>) {
    let compiles = Arc::new(AtomicUsize::new(0));
    let compiler = MockCompiler {
        outputs,
        extra,
        compiles: compiles.clone(),
    };
    let device = DeviceInfo::new(0, "mock device", DeviceKind::Host, memory_limit);

    (
        Arc::new(HostRuntime::with_compiler(device, Box::new(compiler))),
        compiles,
    )
}
