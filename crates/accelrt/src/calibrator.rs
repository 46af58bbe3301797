use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Bins of the activation histogram
pub const HISTOGRAM_BINS: usize = 2048;
/// Levels an int8 value can take on one side of zero, plus zero
const QUANTIZED_BINS: usize = 128;

/// Per-binding absolute maximum chosen by calibration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    amax: BTreeMap<String, f32>,
}
impl CalibrationTable {
    pub fn insert(&mut self, name: impl Into<String>, amax: f32) {
        self.amax.insert(name.into(), amax);
    }
    pub fn amax(&self, name: &str) -> Option<f32> {
        self.amax.get(name).copied()
    }
    /// Int8 scale for a binding, `amax / 127`
    pub fn scale(&self, name: &str) -> Option<f32> {
        self.amax(name).map(|amax| amax / 127.0)
    }
    pub fn is_empty(&self) -> bool {
        self.amax.is_empty()
    }
}

/// Supplies representative input batches to an int8 build
pub trait Int8Calibrator {
    /// Binding the batches are fed to
    fn input_name(&self) -> &str;
    fn batch_size(&self) -> usize;
    /// Next batch of input values, or [None] when the calibration set is exhausted
    fn next_batch(&mut self) -> Result<Option<Vec<f32>>, Error>;
    /// A table from an earlier calibration run, if one should be reused
    fn read_calibration_cache(&mut self) -> Option<CalibrationTable>;
    fn write_calibration_cache(&mut self, table: &CalibrationTable) -> Result<(), Error>;
}

/// Run entropy calibration, or reuse the calibrator's cached table
pub fn calibrate(calibrator: &mut dyn Int8Calibrator) -> Result<CalibrationTable, Error> {
    if let Some(table) = calibrator.read_calibration_cache() {
        info!("using cached calibration table");
        return Ok(table);
    }

    let mut samples = Vec::new();
    let mut batches = 0;
    while let Some(batch) = calibrator.next_batch()? {
        samples.extend(batch.into_iter().map(f32::abs));
        batches += 1;
    }
    if samples.is_empty() {
        return Err(Error::Calibration("no calibration batches".into()));
    }

    let max = samples.iter().copied().fold(0.0f32, f32::max);
    if max <= 0.0 || !max.is_finite() {
        return Err(Error::Calibration(format!(
            "calibration data has no usable range (max |x| = {max})"
        )));
    }

    let bin_width = max / HISTOGRAM_BINS as f32;
    let mut histogram = vec![0u64; HISTOGRAM_BINS];
    for x in samples {
        let bin = ((x / bin_width) as usize).min(HISTOGRAM_BINS - 1);
        histogram[bin] += 1;
    }

    let amax = entropy_threshold(&histogram, bin_width);
    debug!(
        "calibrated `{}` over {batches} batches: max {max}, amax {amax}",
        calibrator.input_name()
    );

    let mut table = CalibrationTable::default();
    table.insert(calibrator.input_name(), amax);
    calibrator.write_calibration_cache(&table)?;

    Ok(table)
}

/// Clipping threshold that minimizes the KL divergence between the clipped histogram and its
/// int8 quantization
pub fn entropy_threshold(histogram: &[u64], bin_width: f32) -> f32 {
    let bins = histogram.len();
    if bins <= QUANTIZED_BINS {
        return bins as f32 * bin_width;
    }

    let mut best = (f64::INFINITY, bins);
    for end in QUANTIZED_BINS..=bins {
        let mut reference: Vec<f64> = histogram[..end].iter().map(|&c| c as f64).collect();
        let outliers: u64 = histogram[end..].iter().sum();
        reference[end - 1] += outliers as f64;

        let candidate = quantize(&histogram[..end]);
        let divergence = kl_divergence(&reference, &candidate);
        if divergence < best.0 {
            best = (divergence, end);
        }
    }

    // Upper edge of the last kept bin
    best.1 as f32 * bin_width
}

/// Merge into [QUANTIZED_BINS] levels, then spread each level over its non-empty source bins
fn quantize(histogram: &[u64]) -> Vec<f64> {
    let merge = histogram.len() as f64 / QUANTIZED_BINS as f64;
    let mut out = vec![0.0; histogram.len()];

    for level in 0..QUANTIZED_BINS {
        let start = (level as f64 * merge).floor() as usize;
        let end = if level == QUANTIZED_BINS - 1 {
            histogram.len()
        } else {
            ((level + 1) as f64 * merge).floor() as usize
        };

        let group = &histogram[start..end];
        let nonzero = group.iter().filter(|c| **c > 0).count();
        if nonzero == 0 {
            continue;
        }
        let avg = group.iter().sum::<u64>() as f64 / nonzero as f64;
        for (i, count) in group.iter().enumerate() {
            if *count > 0 {
                out[start + i] = avg;
            }
        }
    }

    out
}

fn kl_divergence(p: &[f64], q: &[f64]) -> f64 {
    let p_sum: f64 = p.iter().sum();
    let q_sum: f64 = q.iter().sum();
    if p_sum == 0.0 || q_sum == 0.0 {
        return f64::INFINITY;
    }

    let mut divergence = 0.0;
    for (p, q) in p.iter().zip(q) {
        if *p == 0.0 {
            continue;
        }
        if *q == 0.0 {
            return f64::INFINITY;
        }
        let (p, q) = (p / p_sum, q / q_sum);
        divergence += p * (p / q).ln();
    }

    divergence
}

/// Reads calibration images listed in a manifest, one batch at a time
///
/// Images are resized to the configured size and laid out planar (CHW), each value mapped
/// through `x * scale + bias`.
pub struct BatchStream {
    dir: PathBuf,
    files: Vec<String>,
    batch_size: usize,
    max_batches: usize,
    dims: [usize; 3],
    scale: f32,
    bias: f32,
    batch: usize,
}
impl BatchStream {
    /// Open the manifest `list_file` in `dir`
    ///
    /// # Arguments
    ///
    /// * `dims` - Channels, height and width of one image. Channels must be 1 or 3.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest can't be read or the shape is unusable.
    pub fn new(
        dir: impl AsRef<Path>,
        list_file: &str,
        batch_size: usize,
        max_batches: usize,
        dims: [usize; 3],
        scale: f32,
        bias: f32,
    ) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        if batch_size == 0 || dims.iter().any(|d| *d == 0) {
            return Err(Error::Calibration(format!(
                "invalid calibration batch of {batch_size} x {dims:?}"
            )));
        }
        if !matches!(dims[0], 1 | 3) {
            return Err(Error::Calibration(format!(
                "calibration images need 1 or 3 channels, not {}",
                dims[0]
            )));
        }

        let files: Vec<String> = fs::read_to_string(dir.join(list_file))?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        debug!("{} calibration images listed in {list_file}", files.len());

        Ok(Self {
            dir,
            files,
            batch_size,
            max_batches,
            dims,
            scale,
            bias,
            batch: 0,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Load the next batch, or [None] once `max_batches` are read or the manifest runs out
    pub fn next_batch(&mut self) -> Result<Option<Vec<f32>>, Error> {
        let start = self.batch * self.batch_size;
        if self.batch >= self.max_batches || start + self.batch_size > self.files.len() {
            return Ok(None);
        }

        let [c, h, w] = self.dims;
        let mut out = Vec::with_capacity(self.batch_size * c * h * w);
        for name in &self.files[start..start + self.batch_size] {
            self.load(name, &mut out)?;
        }
        self.batch += 1;

        Ok(Some(out))
    }

    fn load(&self, name: &str, out: &mut Vec<f32>) -> Result<(), Error> {
        let [c, h, w] = self.dims;
        let path = self.dir.join(name);
        let image = image::open(&path)
            .map_err(|err| Error::Calibration(format!("{}: {err}", path.display())))?
            .resize_exact(w as u32, h as u32, FilterType::Triangle);

        let pixels = if c == 1 {
            image.to_luma8().into_raw()
        } else {
            image.to_rgb8().into_raw()
        };

        for channel in 0..c {
            out.extend(
                pixels
                    .iter()
                    .skip(channel)
                    .step_by(c)
                    .map(|p| *p as f32 * self.scale + self.bias),
            );
        }

        Ok(())
    }
}

/// Entropy calibrator over a [BatchStream], with an optional on-disk table cache
pub struct EntropyCalibrator {
    stream: BatchStream,
    input_name: String,
    cache: Option<PathBuf>,
    read_cache: bool,
}
impl EntropyCalibrator {
    pub fn new(stream: BatchStream, input_name: impl Into<String>) -> Self {
        Self {
            stream,
            input_name: input_name.into(),
            cache: None,
            read_cache: true,
        }
    }

    /// Persist the table to `path` and reuse it on later builds if `read` is set
    pub fn with_cache(mut self, path: impl Into<PathBuf>, read: bool) -> Self {
        self.cache = Some(path.into());
        self.read_cache = read;
        self
    }
}
impl Int8Calibrator for EntropyCalibrator {
    fn input_name(&self) -> &str {
        &self.input_name
    }

    fn batch_size(&self) -> usize {
        self.stream.batch_size()
    }

    fn next_batch(&mut self) -> Result<Option<Vec<f32>>, Error> {
        self.stream.next_batch()
    }

    fn read_calibration_cache(&mut self) -> Option<CalibrationTable> {
        let path = self.cache.as_ref().filter(|_| self.read_cache)?;
        let bytes = fs::read(path).ok()?;

        match serde_json::from_slice(&bytes) {
            Ok(table) => Some(table),
            Err(err) => {
                warn!("ignoring calibration cache {}: {err}", path.display());
                None
            }
        }
    }

    fn write_calibration_cache(&mut self, table: &CalibrationTable) -> Result<(), Error> {
        if let Some(path) = &self.cache {
            fs::write(path, serde_json::to_vec_pretty(table)?)?;
            debug!("wrote calibration cache {}", path.display());
        }

        Ok(())
    }
}
