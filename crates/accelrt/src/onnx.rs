use std::path::Path;

use tract_onnx::prelude::*;

use crate::{
    calibrate, BindingInfo, BuilderConfig, DataType, Direction, Error, Int8Calibrator, Kernel,
    Network, NetworkCompiler, Plan, PlanHeader, Precision,
};

type Runnable = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

const PRODUCER: &str = "accelrt-onnx";

/// Compiles ONNX models for the host device
///
/// The plan payload is the ONNX model itself. Int8 plans keep float bindings and round input
/// values to the calibrated int8 grid before each launch.
pub struct OnnxCompiler;
impl NetworkCompiler for OnnxCompiler {
    fn name(&self) -> &str {
        PRODUCER
    }

    fn compile(
        &self,
        model: &Path,
        config: &BuilderConfig,
        calibrator: Option<&mut dyn Int8Calibrator>,
    ) -> Result<Plan, Error> {
        let network = std::fs::read(model)?;
        let typed = parse(&network)?;
        let mut bindings = bindings_of(&typed)?;

        let calibration = match (config.precision, calibrator) {
            (Precision::Int8, Some(calibrator)) => {
                let table = calibrate(calibrator)?;
                for binding in bindings.iter_mut().filter(|b| b.is_input()) {
                    binding.scale = table.scale(&binding.name);
                }
                Some(table)
            }
            (Precision::Fp16, _) => {
                debug!("fp16 plans execute in fp32 on the host device");
                None
            }
            _ => None,
        };

        Ok(Plan {
            header: PlanHeader {
                producer: PRODUCER.into(),
                precision: config.precision,
                bindings,
                calibration,
            },
            network,
        })
    }

    fn load(&self, plan: &Plan) -> Result<Box<dyn Network>, Error> {
        let model = parse(&plan.network).map_err(|err| Error::Deserialize(err.to_string()))?;

        Ok(Box::new(OnnxNetwork {
            model,
            bindings: plan.header.bindings.clone(),
        }))
    }
}

fn parse(bytes: &[u8]) -> Result<TypedModel, Error> {
    tract_onnx::onnx()
        .model_for_read(&mut &bytes[..])
        .and_then(|model| model.into_typed())
        .map_err(|err| Error::Parse(err.to_string()))
}

fn data_type(datum_type: DatumType) -> Option<DataType> {
    match datum_type {
        DatumType::F32 => Some(DataType::Float),
        DatumType::F16 => Some(DataType::Half),
        DatumType::I8 => Some(DataType::Int8),
        // 64-bit integers are narrowed like on real accelerators
        DatumType::I32 | DatumType::I64 => Some(DataType::Int32),
        DatumType::U8 => Some(DataType::Uint8),
        DatumType::Bool => Some(DataType::Bool),
        _ => None,
    }
}

fn bindings_of(model: &TypedModel) -> Result<Vec<BindingInfo>, Error> {
    let parse_err = |err: TractError| Error::Parse(err.to_string());

    let mut bindings = Vec::new();
    for (direction, outlets) in [
        (Direction::Input, model.input_outlets().map_err(parse_err)?),
        (Direction::Output, model.output_outlets().map_err(parse_err)?),
    ] {
        for outlet in outlets {
            let name = model
                .outlet_label(*outlet)
                .unwrap_or(model.node(outlet.node).name.as_str())
                .to_string();
            let fact = model.outlet_fact(*outlet).map_err(parse_err)?;

            let dims = fact
                .shape
                .as_concrete()
                .ok_or_else(|| Error::Parse(format!("`{name}` has a dynamic shape")))?
                .to_vec();
            let data_type = data_type(fact.datum_type).ok_or_else(|| {
                Error::Parse(format!("`{name}` has unsupported type {:?}", fact.datum_type))
            })?;

            bindings.push(BindingInfo {
                name,
                direction,
                dims,
                data_type,
                scale: None,
            });
        }
    }

    Ok(bindings)
}

struct OnnxNetwork {
    model: TypedModel,
    bindings: Vec<BindingInfo>,
}
impl Network for OnnxNetwork {
    fn instantiate(&self) -> Result<Box<dyn Kernel>, Error> {
        let context_err = |err: TractError| Error::ContextCreation(err.to_string());

        let input_types = (0..self.model.inputs.len())
            .map(|i| self.model.input_fact(i).map(|fact| fact.datum_type))
            .collect::<TractResult<Vec<_>>>()
            .map_err(context_err)?;
        let plan = self
            .model
            .clone()
            .into_optimized()
            .and_then(|model| model.into_runnable())
            .map_err(context_err)?;

        let (inputs, outputs): (Vec<_>, Vec<_>) = self
            .bindings
            .iter()
            .cloned()
            .partition(BindingInfo::is_input);

        Ok(Box::new(OnnxKernel {
            plan,
            input_types,
            inputs,
            outputs,
        }))
    }
}

struct OnnxKernel {
    plan: Runnable,
    input_types: Vec<DatumType>,
    inputs: Vec<BindingInfo>,
    outputs: Vec<BindingInfo>,
}
impl Kernel for OnnxKernel {
    fn forward(&mut self, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<(), Error> {
        let launch_err = |err: TractError| Error::Launch(err.to_string());

        let mut values: TVec<TValue> = tvec!();
        for ((info, datum_type), bytes) in self.inputs.iter().zip(&self.input_types).zip(inputs) {
            let tensor = to_tensor(info, bytes)?;
            let tensor = tensor.cast_to_dt(*datum_type).map_err(launch_err)?.into_owned();
            values.push(tensor.into());
        }

        let results = self.plan.run(values).map_err(launch_err)?;
        if results.len() != outputs.len() {
            return Err(Error::Launch(format!(
                "network produced {} outputs for {} bindings",
                results.len(),
                outputs.len()
            )));
        }

        for ((info, value), out) in self.outputs.iter().zip(results.iter()).zip(outputs.iter_mut()) {
            write_output(info, value, out)?;
        }

        Ok(())
    }
}

/// Round values onto the symmetric int8 grid of `scale`
fn fake_quantize(values: &mut [f32], scale: f32) {
    if scale <= 0.0 {
        return;
    }
    for x in values {
        *x = (*x / scale).round().clamp(-127.0, 127.0) * scale;
    }
}

fn to_tensor(info: &BindingInfo, bytes: &[u8]) -> Result<Tensor, Error> {
    let words = || bytes.chunks_exact(4).map(|c| [c[0], c[1], c[2], c[3]]);

    let tensor = match info.data_type {
        DataType::Float | DataType::Half => {
            let mut values: Vec<f32> = words().map(f32::from_ne_bytes).collect();
            if let Some(scale) = info.scale {
                fake_quantize(&mut values, scale);
            }
            Tensor::from_shape(&info.dims, &values)
        }
        DataType::Int32 => {
            let values: Vec<i32> = words().map(i32::from_ne_bytes).collect();
            Tensor::from_shape(&info.dims, &values)
        }
        DataType::Int8 => {
            let values: Vec<i8> = bytes.iter().map(|b| *b as i8).collect();
            Tensor::from_shape(&info.dims, &values)
        }
        data_type => {
            return Err(Error::UnsupportedDataType {
                name: info.name.clone(),
                data_type,
            })
        }
    };

    tensor.map_err(|err| Error::Launch(format!("`{}`: {err}", info.name)))
}

fn write_output(info: &BindingInfo, value: &Tensor, out: &mut [u8]) -> Result<(), Error> {
    let launch_err = |err: TractError| Error::Launch(format!("`{}`: {err}", info.name));

    let bytes: Vec<u8> = match info.data_type {
        DataType::Float | DataType::Half => {
            let cast = value.cast_to::<f32>().map_err(launch_err)?;
            bytemuck::cast_slice(cast.as_slice::<f32>().map_err(launch_err)?).to_vec()
        }
        DataType::Int32 => {
            let cast = value.cast_to::<i32>().map_err(launch_err)?;
            bytemuck::cast_slice(cast.as_slice::<i32>().map_err(launch_err)?).to_vec()
        }
        DataType::Int8 => {
            let cast = value.cast_to::<i8>().map_err(launch_err)?;
            bytemuck::cast_slice(cast.as_slice::<i8>().map_err(launch_err)?).to_vec()
        }
        data_type => {
            return Err(Error::UnsupportedDataType {
                name: info.name.clone(),
                data_type,
            })
        }
    };

    if bytes.len() != out.len() {
        return Err(Error::SizeMismatch {
            len: bytes.len(),
            size: out.len(),
        });
    }
    out.copy_from_slice(&bytes);

    Ok(())
}
