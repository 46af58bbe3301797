//!
//! Turns caller frames into model input tensors
//!
//! Images are cropped, or resized straight from the crop window, then color converted and finally
//! type converted with normalization fused into the layout write. Blobs are copied, or transposed
//! if their layout differs from the tensor's.
//!

use std::borrow::Cow;

use fast_image_resize::images::{Image, ImageRef};
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use rayon::prelude::*;

use crate::buffer::HostBuffer;
use crate::error::{Error, Result};
use crate::tensor::{
    ColorOrder, Dims, FusedNormalize, ImageRegion, InputTensorInfo, Layout, SourceFormat,
};

/// Fill `dst`, the staging buffer of `input`, from one source frame
///
/// Parallel loops run on the current rayon pool.
///
/// # Errors
///
/// Fails if the frame doesn't match the descriptor, the conversion isn't supported, or the
/// staging buffer no longer sits where it was allocated afterwards.
pub fn convert(
    input: &InputTensorInfo,
    fused: &FusedNormalize,
    src: &[u8],
    dst: &mut HostBuffer,
) -> Result<()> {
    let before = (dst.as_ptr(), dst.len());

    if input.source.is_image() {
        convert_image(input, fused, src, dst)?;
    } else {
        copy_blob(input, src, dst)?;
    }

    if (dst.as_ptr(), dst.len()) != before {
        return Err(Error::StagingBufferMoved {
            name: input.tensor.name.clone(),
        });
    }

    Ok(())
}

fn tensor_dims(input: &InputTensorInfo, dst: &HostBuffer) -> Result<Dims> {
    let name = &input.tensor.name;
    let dims = input.tensor.dims().ok_or_else(|| {
        Error::Configuration(format!("`{name}` has shape {:?}", input.tensor.shape))
    })?;
    if dims.volume() != dst.len() {
        return Err(Error::Configuration(format!(
            "`{name}` has {} elements but its staging buffer holds {}",
            dims.volume(),
            dst.len()
        )));
    }
    Ok(dims)
}

fn convert_image(
    input: &InputTensorInfo,
    fused: &FusedNormalize,
    src: &[u8],
    dst: &mut HostBuffer,
) -> Result<()> {
    let name = &input.tensor.name;
    let region = &input.image;
    region.validate(name)?;
    if src.len() < region.frame_len() {
        return Err(Error::Configuration(format!(
            "`{name}` frame has {} bytes, expected {}",
            src.len(),
            region.frame_len()
        )));
    }

    let dims = tensor_dims(input, dst)?;
    if dims.batch != 1 {
        return Err(Error::Configuration(format!(
            "`{name}` takes a batch of {} but images are single frames",
            dims.batch
        )));
    }

    let resized = if (region.crop_width, region.crop_height) == (dims.width, dims.height) {
        crop(
            src,
            region.width,
            region.channel,
            (region.crop_x, region.crop_y),
            (region.crop_width, region.crop_height),
        )
    } else {
        Cow::Owned(resize(
            &src[..region.frame_len()],
            region,
            (dims.width, dims.height),
        )?)
    };

    let source_order = match input.source {
        SourceFormat::ImageBgr => ColorOrder::Bgr,
        _ => ColorOrder::Rgb,
    };
    let pixels = convert_color(
        resized,
        (region.channel, source_order),
        (dims.channel, input.color_order),
    )?;

    write_pixels(&pixels, dims, input.tensor.layout, fused, dst)
}

/// Cut a `size` rectangle at `origin` out of an interleaved image `width` pixels wide
fn crop<'a>(
    src: &'a [u8],
    width: usize,
    channel: usize,
    origin: (usize, usize),
    size: (usize, usize),
) -> Cow<'a, [u8]> {
    let (x, y) = origin;
    let (crop_width, crop_height) = size;
    let row = width * channel;

    if x == 0 && crop_width == width {
        return Cow::Borrowed(&src[y * row..(y + crop_height) * row]);
    }

    let crop_row = crop_width * channel;
    let mut out = Vec::with_capacity(crop_row * crop_height);
    for line in y..y + crop_height {
        let start = line * row + x * channel;
        out.extend_from_slice(&src[start..start + crop_row]);
    }

    Cow::Owned(out)
}

/// Resize the crop window of `region` straight out of the source frame
fn resize(src: &[u8], region: &ImageRegion, to: (usize, usize)) -> Result<Vec<u8>> {
    let pixel_type = match region.channel {
        1 => PixelType::U8,
        2 => PixelType::U8x2,
        3 => PixelType::U8x3,
        4 => PixelType::U8x4,
        n => return Err(Error::unsupported(format!("{n}-channel image"), "resize")),
    };

    let src_image = ImageRef::new(region.width as u32, region.height as u32, src, pixel_type)
        .map_err(|err| Error::Configuration(format!("bad source image: {err}")))?;
    let mut dst_image = Image::new(to.0 as u32, to.1 as u32, pixel_type);

    let mut options = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));
    if (region.crop_width, region.crop_height) != (region.width, region.height) {
        options = options.crop(
            region.crop_x as f64,
            region.crop_y as f64,
            region.crop_width as f64,
            region.crop_height as f64,
        );
    }

    Resizer::new()
        .resize(&src_image, &mut dst_image, &options)
        .map_err(|err| Error::Execution(format!("resize failed: {err}")))?;

    Ok(dst_image.into_vec())
}

#[inline]
fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8
}

fn convert_color<'a>(
    pixels: Cow<'a, [u8]>,
    (from, from_order): (usize, ColorOrder),
    (to, to_order): (usize, ColorOrder),
) -> Result<Cow<'a, [u8]>> {
    let swap = from_order != to_order;
    let (r, b) = match from_order {
        ColorOrder::Rgb => (0, 2),
        ColorOrder::Bgr => (2, 0),
    };

    Ok(match (from, to) {
        (1, 1) => pixels,
        (3, 3) if !swap => pixels,
        (3, 3) => Cow::Owned(
            pixels
                .chunks_exact(3)
                .flat_map(|p| [p[2], p[1], p[0]])
                .collect(),
        ),
        (4, 3) => Cow::Owned(
            pixels
                .chunks_exact(4)
                .flat_map(|p| if swap { [p[2], p[1], p[0]] } else { [p[0], p[1], p[2]] })
                .collect(),
        ),
        (3 | 4, 1) => Cow::Owned(
            pixels
                .chunks_exact(from)
                .map(|p| luma(p[r], p[1], p[b]))
                .collect(),
        ),
        (1, 3) => Cow::Owned(pixels.iter().flat_map(|p| [*p; 3]).collect()),
        (from, to) => {
            return Err(Error::unsupported(
                format!("{from}-channel image"),
                format!("{to}-channel tensor"),
            ))
        }
    })
}

/// Write interleaved pixels into `dst`, normalizing float targets
fn write_pixels(
    pixels: &[u8],
    dims: Dims,
    layout: Layout,
    fused: &FusedNormalize,
    dst: &mut HostBuffer,
) -> Result<()> {
    let channel = dims.channel;
    let plane = dims.height * dims.width;

    match (dst, layout) {
        (HostBuffer::F32(out), Layout::Nhwc) => {
            out.par_chunks_mut(channel)
                .zip(pixels.par_chunks(channel))
                .for_each(|(out, pixel)| {
                    for c in 0..channel {
                        out[c] = fused.apply(c, pixel[c]);
                    }
                });
        }
        (HostBuffer::F32(out), Layout::Nchw) => {
            out.par_chunks_mut(plane).enumerate().for_each(|(c, out)| {
                for (i, value) in out.iter_mut().enumerate() {
                    *value = fused.apply(c, pixels[i * channel + c]);
                }
            });
        }
        (HostBuffer::U8(out), Layout::Nhwc) => out.copy_from_slice(pixels),
        (HostBuffer::U8(out), Layout::Nchw) => {
            out.par_chunks_mut(plane).enumerate().for_each(|(c, out)| {
                for (i, value) in out.iter_mut().enumerate() {
                    *value = pixels[i * channel + c];
                }
            });
        }
        (other, _) => return Err(Error::unsupported("8-bit image", other.tensor_type())),
    }

    Ok(())
}

fn copy_blob(input: &InputTensorInfo, src: &[u8], dst: &mut HostBuffer) -> Result<()> {
    let name = &input.tensor.name;
    let expected = dst.as_bytes().len();
    if src.len() != expected {
        return Err(Error::Configuration(format!(
            "`{name}` blob has {} bytes, expected {expected}",
            src.len()
        )));
    }

    let from = match input.source {
        SourceFormat::BlobNhwc => Layout::Nhwc,
        _ => Layout::Nchw,
    };
    if from == input.tensor.layout {
        dst.as_bytes_mut().copy_from_slice(src);
        return Ok(());
    }

    let dims = tensor_dims(input, dst)?;
    let element = dst.tensor_type().size();
    transpose(src, dst.as_bytes_mut(), from, dims, element);

    Ok(())
}

/// Reorder `src`, laid out as `from`, into the other 4-D layout
///
/// Works on raw bytes; `element` is the size of one value.
pub(crate) fn transpose(src: &[u8], dst: &mut [u8], from: Layout, dims: Dims, element: usize) {
    let channel = dims.channel;
    let plane = dims.height * dims.width;
    let item = channel * plane * element;
    if item == 0 {
        return;
    }

    dst.par_chunks_mut(item)
        .zip(src.par_chunks(item))
        .for_each(|(dst, src)| {
            for c in 0..channel {
                for i in 0..plane {
                    let (nhwc, nchw) = ((i * channel + c) * element, (c * plane + i) * element);
                    let (s, d) = match from {
                        Layout::Nhwc => (nhwc, nchw),
                        Layout::Nchw => (nchw, nhwc),
                    };
                    dst[d..d + element].copy_from_slice(&src[s..s + element]);
                }
            }
        });
}
