use std::fs;
use std::path::{Path, PathBuf};

use accelrt::Precision;

use crate::engine::{CalibrationOptions, EngineKind, EngineOptions};
use crate::error::{Error, Result};
use crate::tensor::{
    ColorOrder, ImageRegion, InputTensorInfo, Layout, Normalize, OutputTensorInfo, SourceFormat,
    TensorType,
};

macro_rules! def_cfg {
    ($(
        $(#[$struct_attr:meta])*
        $struct_ident:ident {
            $(
            $(#[$field_attr:meta])*
            $ident:ident : $ty:ty ,
            )*
        }
    )*) => {
       $(
           $(#[$struct_attr])*
           #[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
           pub struct $struct_ident {
               $(
                $(#[$field_attr])*
                pub $ident: $ty,
               )*
           }
       )*
    };
}

def_cfg! {
    /// Everything needed to run a model from the command line
    Config {
        backend: EngineKind,
        model: PathBuf,
        num_threads: Option<usize>,
        precision: Option<Precision>,
        device: Option<usize>,
        dla_core: Option<u32>,
        calibration: Option<CalibrationOptions>,
        /// env_logger filter; `RUST_LOG` wins if it's set
        log_filter: Option<String>,
        #[serde(default)]
        inputs: Vec<InputConfig>,
        #[serde(default)]
        outputs: Vec<OutputConfig>,
    }
    InputConfig {
        name: String,
        tensor_type: Option<TensorType>,
        shape: Option<Vec<usize>>,
        layout: Option<Layout>,
        source: Option<SourceFormat>,
        color_order: Option<ColorOrder>,
        mean: Option<[f32; 3]>,
        norm: Option<[f32; 3]>,
        /// x, y, width and height of the region to feed the model
        crop: Option<[usize; 4]>,
    }
    OutputConfig {
        name: String,
    }
}

impl Config {
    /// Load the configuration from the specified path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Save the configuration to the specified path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = toml::to_string_pretty(self)
            .map_err(|err| Error::Configuration(format!("failed to serialize config: {err}")))?;
        fs::write(path, raw)?;

        Ok(())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            precision: self.precision.unwrap_or_default(),
            calibration: self.calibration.clone(),
            device: self.device.unwrap_or(0),
            dla_core: self.dla_core,
        }
    }

    /// Input descriptors for frames of the given geometry
    pub fn input_descriptors(&self, frame: ImageRegion) -> Vec<InputTensorInfo> {
        self.inputs.iter().map(|input| input.descriptor(frame)).collect()
    }

    pub fn output_descriptors(&self) -> Vec<OutputTensorInfo> {
        self.outputs
            .iter()
            .map(|output| OutputTensorInfo::new(&output.name))
            .collect()
    }
}

impl InputConfig {
    pub fn descriptor(&self, frame: ImageRegion) -> InputTensorInfo {
        let mut input = InputTensorInfo::new(&self.name);
        input.tensor.tensor_type = self.tensor_type.unwrap_or_default();
        input.tensor.shape = self.shape.clone().unwrap_or_default();
        input.tensor.layout = self.layout.unwrap_or_default();
        input.source = self.source.unwrap_or(SourceFormat::ImageRgb);
        input.color_order = self.color_order.unwrap_or_default();

        let defaults = Normalize::default();
        input.normalize = Normalize {
            mean: self.mean.unwrap_or(defaults.mean),
            norm: self.norm.unwrap_or(defaults.norm),
        };

        input.image = match self.crop {
            Some([x, y, width, height]) => frame.with_crop(x, y, width, height),
            None => frame,
        };

        input
    }
}
