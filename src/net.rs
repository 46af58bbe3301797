use crate::buffer::HostBuffer;
use crate::error::Result;

#[cfg(feature = "onnx")]
pub use self::tract::TractNet;

/// A tensor handed to or returned by a [Net]
#[derive(Clone, Debug, PartialEq)]
pub struct Blob {
    pub shape: Vec<usize>,
    pub data: HostBuffer,
}

/// A graph executor that runs a model up to named layers
pub trait Net: Send {
    /// Names of the graph inputs, in order
    fn input_names(&self) -> &[String];

    /// Names of every layer whose output can be requested
    fn layer_names(&self) -> &[String];

    /// Set the value fed to an input on later forward passes
    fn set_input(&mut self, name: &str, blob: Blob) -> Result<()>;

    /// Run the graph and return one blob per requested output, in order
    fn forward(&mut self, outputs: &[String]) -> Result<Vec<Blob>>;
}

#[cfg(feature = "onnx")]
mod tract {
    use std::path::Path;

    use tract_onnx::prelude::*;

    use super::{Blob, Net};
    use crate::buffer::HostBuffer;
    use crate::error::{Error, Result};

    type Runnable =
        RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

    struct Compiled {
        outputs: Vec<String>,
        shapes: Vec<Vec<usize>>,
        plan: Runnable,
    }

    /// ONNX graph executor
    ///
    /// The model is optimized for the current input shapes and requested outputs on the first
    /// forward pass, and again whenever either changes.
    pub struct TractNet {
        model: InferenceModel,
        inputs: Vec<String>,
        layers: Vec<String>,
        pending: Vec<Option<Blob>>,
        compiled: Option<Compiled>,
    }
    impl TractNet {
        /// Load an ONNX model
        pub fn load(path: &Path) -> Result<Self> {
            let config_err =
                |err: TractError| Error::Configuration(format!("{}: {err}", path.display()));

            let model = tract_onnx::onnx()
                .model_for_path(path)
                .map_err(config_err)?;

            let inputs: Vec<String> = model
                .input_outlets()
                .map_err(config_err)?
                .iter()
                .map(|outlet| model.node(outlet.node).name.clone())
                .collect();

            let mut layers = Vec::new();
            for node in model.nodes() {
                layers.push(node.name.clone());
                for slot in 0..node.outputs.len() {
                    if let Some(label) = model.outlet_label(OutletId::new(node.id, slot)) {
                        if label != node.name {
                            layers.push(label.to_string());
                        }
                    }
                }
            }
            debug!(
                "loaded {} with {} inputs and {} layers",
                path.display(),
                inputs.len(),
                layers.len()
            );

            Ok(Self {
                pending: vec![None; inputs.len()],
                model,
                inputs,
                layers,
                compiled: None,
            })
        }
    }
    impl Net for TractNet {
        fn input_names(&self) -> &[String] {
            &self.inputs
        }

        fn layer_names(&self) -> &[String] {
            &self.layers
        }

        fn set_input(&mut self, name: &str, blob: Blob) -> Result<()> {
            let index = self
                .inputs
                .iter()
                .position(|input| input == name)
                .ok_or_else(|| Error::TensorNotFound { name: name.into() })?;
            if !matches!(blob.data, HostBuffer::F32(_)) {
                return Err(Error::unsupported(blob.data.tensor_type(), "graph input"));
            }

            self.pending[index] = Some(blob);
            Ok(())
        }

        fn forward(&mut self, outputs: &[String]) -> Result<Vec<Blob>> {
            let exec_err = |err: TractError| Error::Execution(err.to_string());

            let mut blobs = Vec::with_capacity(self.pending.len());
            for (name, blob) in self.inputs.iter().zip(&self.pending) {
                let blob = blob
                    .as_ref()
                    .ok_or_else(|| Error::Configuration(format!("input `{name}` isn't set")))?;
                blobs.push(blob);
            }
            let shapes: Vec<Vec<usize>> = blobs.iter().map(|blob| blob.shape.clone()).collect();

            let stale = self
                .compiled
                .as_ref()
                .map_or(true, |c| c.outputs != outputs || c.shapes != shapes);
            if stale {
                debug!("optimizing graph for {shapes:?} -> {outputs:?}");

                let mut model = self.model.clone();
                for (i, shape) in shapes.iter().enumerate() {
                    model = model
                        .with_input_fact(i, InferenceFact::dt_shape(f32::datum_type(), shape.clone()))
                        .map_err(exec_err)?;
                }
                let plan = model
                    .with_output_names(outputs)
                    .and_then(|model| model.into_optimized())
                    .and_then(|model| model.into_runnable())
                    .map_err(exec_err)?;

                self.compiled = Some(Compiled {
                    outputs: outputs.to_vec(),
                    shapes,
                    plan,
                });
            }

            let mut values: TVec<TValue> = tvec!();
            for blob in blobs {
                if let HostBuffer::F32(data) = &blob.data {
                    values.push(Tensor::from_shape(&blob.shape, data).map_err(exec_err)?.into());
                }
            }

            let compiled = self
                .compiled
                .as_ref()
                .ok_or_else(|| Error::Execution("graph wasn't compiled".into()))?;
            let results = compiled.plan.run(values).map_err(exec_err)?;

            results
                .iter()
                .map(|value| {
                    let value = value.cast_to::<f32>().map_err(exec_err)?;
                    Ok(Blob {
                        shape: value.shape().to_vec(),
                        data: HostBuffer::F32(value.as_slice::<f32>().map_err(exec_err)?.to_vec()),
                    })
                })
                .collect()
        }
    }
}
