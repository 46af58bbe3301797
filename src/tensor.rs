use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::TensorData;
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Element type of a tensor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorType {
    /// Unset; a backend fills it in at initialization
    #[default]
    None,
    Uint8,
    Fp32,
    Int32,
    Int64,
}
impl TensorType {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            Self::None => 0,
            Self::Uint8 => 1,
            Self::Fp32 | Self::Int32 => 4,
            Self::Int64 => 8,
        }
    }
}
impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Debug>::fmt(self, f)
    }
}

/// Order of a 4-D tensor's dimensions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    Nhwc,
    #[default]
    Nchw,
}

/// Batch, channel, height and width of a tensor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dims {
    pub batch: usize,
    pub channel: usize,
    pub height: usize,
    pub width: usize,
}
impl Dims {
    /// Interpret `shape` in `layout`
    ///
    /// Shapes with fewer than four dimensions are padded with leading ones, so a `[c, h, w]`
    /// shape reads as a batch of one.
    pub fn from_shape(shape: &[usize], layout: Layout) -> Option<Self> {
        if shape.len() > 4 {
            return None;
        }
        let mut full = [1; 4];
        full[4 - shape.len()..].copy_from_slice(shape);

        let [n, a, b, c] = full;
        Some(match layout {
            Layout::Nchw => Self {
                batch: n,
                channel: a,
                height: b,
                width: c,
            },
            Layout::Nhwc => Self {
                batch: n,
                height: a,
                width: b,
                channel: c,
            },
        })
    }
    pub fn volume(&self) -> usize {
        self.batch * self.channel * self.height * self.width
    }
}

/// Affine int8/uint8 quantization, `real = (q - zero_point) * scale`
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Quant {
    pub scale: f32,
    pub zero_point: i32,
}
impl Quant {
    #[inline]
    pub fn dequantize(&self, q: u8) -> f32 {
        (q as i32 - self.zero_point) as f32 * self.scale
    }
}

/// Identifies the engine a descriptor was bound by, and its slot there
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Binding {
    pub engine: u64,
    pub slot: usize,
    pub input: bool,
}

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_engine_id() -> u64 {
    NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Descriptor of one model tensor
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub tensor_type: TensorType,
    pub shape: Vec<usize>,
    pub layout: Layout,
    pub quant: Quant,
    pub(crate) binding: Option<Binding>,
}
impl TensorInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Number of elements, 0 while the shape is unset
    pub fn volume(&self) -> usize {
        if self.shape.is_empty() {
            0
        } else {
            self.shape.iter().product()
        }
    }

    pub fn dims(&self) -> Option<Dims> {
        Dims::from_shape(&self.shape, self.layout)
    }

    /// Whether an engine has bound this descriptor
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub(crate) fn bound(&self, engine: u64) -> Result<Binding> {
        match self.binding {
            Some(binding) if binding.engine == engine => Ok(binding),
            Some(_) => Err(Error::Configuration(format!(
                "`{}` was bound by a different engine",
                self.name
            ))),
            None => Err(Error::Configuration(format!(
                "`{}` hasn't been bound by an engine",
                self.name
            ))),
        }
    }

    pub(crate) fn check_quant(&self) -> Result<()> {
        if self.tensor_type == TensorType::Uint8 && !(self.quant.scale > 0.0) {
            return Err(Error::Configuration(format!(
                "quantized tensor `{}` has scale {}",
                self.name, self.quant.scale
            )));
        }
        Ok(())
    }
}

/// What the caller hands to preprocessing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// Interleaved 8-bit pixels in B, G, R order
    #[default]
    ImageBgr,
    /// Interleaved 8-bit pixels in R, G, B order
    ImageRgb,
    /// Raw tensor bytes, NHWC
    BlobNhwc,
    /// Raw tensor bytes, NCHW
    BlobNchw,
}
impl SourceFormat {
    pub fn is_image(self) -> bool {
        matches!(self, Self::ImageBgr | Self::ImageRgb)
    }
}

/// Channel order a model expects
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorOrder {
    #[default]
    Rgb,
    Bgr,
}

/// Geometry of a source image and the region of it to feed the model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageRegion {
    pub width: usize,
    pub height: usize,
    pub channel: usize,
    pub crop_x: usize,
    pub crop_y: usize,
    pub crop_width: usize,
    pub crop_height: usize,
}
impl ImageRegion {
    /// Whole `width` x `height` frame with `channel` interleaved channels
    pub fn full(width: usize, height: usize, channel: usize) -> Self {
        Self {
            width,
            height,
            channel,
            crop_x: 0,
            crop_y: 0,
            crop_width: width,
            crop_height: height,
        }
    }

    pub fn with_crop(mut self, x: usize, y: usize, width: usize, height: usize) -> Self {
        self.crop_x = x;
        self.crop_y = y;
        self.crop_width = width;
        self.crop_height = height;
        self
    }

    pub fn is_full_frame(&self) -> bool {
        self.crop_x == 0
            && self.crop_y == 0
            && self.crop_width == self.width
            && self.crop_height == self.height
    }

    /// Bytes in one source frame
    pub fn frame_len(&self) -> usize {
        self.width * self.height * self.channel
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        if self.frame_len() == 0 || self.crop_width == 0 || self.crop_height == 0 {
            return Err(Error::Configuration(format!(
                "`{name}` has an empty source image or crop"
            )));
        }
        if self.crop_x + self.crop_width > self.width || self.crop_y + self.crop_height > self.height
        {
            return Err(Error::Configuration(format!(
                "`{name}` crops {}x{}+{}+{} out of a {}x{} image",
                self.crop_width, self.crop_height, self.crop_x, self.crop_y, self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Per-channel normalization, `((pixel / 255) - mean) / norm`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Normalize {
    pub mean: [f32; 3],
    pub norm: [f32; 3],
}
impl Default for Normalize {
    fn default() -> Self {
        Self {
            mean: [0.0; 3],
            norm: [1.0; 3],
        }
    }
}
impl Normalize {
    /// Fold the parameters into one multiply-add per element
    pub fn fused(&self) -> Result<FusedNormalize> {
        let mut fused = FusedNormalize {
            scale: [0.0; 3],
            bias: [0.0; 3],
        };
        for c in 0..3 {
            let norm = self.norm[c];
            if !(norm.is_finite() && norm != 0.0) {
                return Err(Error::Configuration(format!(
                    "normalization divisor {norm} for channel {c}"
                )));
            }
            fused.scale[c] = 1.0 / (255.0 * norm);
            fused.bias[c] = self.mean[c] / norm;
        }
        Ok(fused)
    }
}

/// Normalization as `pixel * scale - bias`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FusedNormalize {
    pub scale: [f32; 3],
    pub bias: [f32; 3],
}
impl FusedNormalize {
    #[inline]
    pub fn apply(&self, channel: usize, pixel: u8) -> f32 {
        pixel as f32 * self.scale[channel] - self.bias[channel]
    }
}

/// Input descriptor: the tensor plus how to build it from caller data
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InputTensorInfo {
    pub tensor: TensorInfo,
    pub source: SourceFormat,
    pub image: ImageRegion,
    pub normalize: Normalize,
    /// Channel order the model expects
    pub color_order: ColorOrder,
}
impl InputTensorInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            tensor: TensorInfo::new(name),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
struct FloatCache {
    generation: u64,
    values: Vec<f32>,
}

/// Output descriptor
///
/// Results are read through [OutputTensorInfo::float_view], which dequantizes 8-bit outputs
/// into a cache that is rebuilt once per engine invocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutputTensorInfo {
    pub tensor: TensorInfo,
    cache: Option<FloatCache>,
}
impl OutputTensorInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            tensor: TensorInfo::new(name),
            cache: None,
        }
    }

    /// Raw output data of the last invocation
    pub fn data<'a>(&self, engine: &'a dyn Engine) -> Result<TensorData<'a>> {
        engine.tensor_data(&self.tensor)
    }

    /// Output values as floats
    ///
    /// Float outputs are borrowed straight from the engine. Quantized outputs are dequantized
    /// with the tensor's scale and zero point; the result stays cached until the engine runs
    /// again.
    ///
    /// # Errors
    ///
    /// Returns [Error::UnsupportedConversion] for integer outputs.
    pub fn float_view<'a>(&'a mut self, engine: &'a dyn Engine) -> Result<&'a [f32]> {
        match engine.tensor_data(&self.tensor)? {
            TensorData::F32(values) => Ok(values),
            TensorData::U8(raw) => {
                let generation = engine.generation();
                let stale = self
                    .cache
                    .as_ref()
                    .map_or(true, |cache| cache.generation != generation);

                if stale {
                    let quant = self.tensor.quant;
                    let cache = self.cache.get_or_insert_with(FloatCache::default);
                    cache.generation = generation;
                    cache.values.clear();
                    cache.values.extend(raw.iter().map(|q| quant.dequantize(*q)));
                }

                Ok(self
                    .cache
                    .as_ref()
                    .map(|cache| cache.values.as_slice())
                    .unwrap_or_default())
            }
            other => Err(Error::unsupported(other.tensor_type(), TensorType::Fp32)),
        }
    }
}
