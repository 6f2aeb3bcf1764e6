//! Resize-out & encode: model output back to a PNG at the upload's size.

use std::io::Cursor;

use image::imageops;
use image::{ImageFormat, RgbImage};

use crate::error::{DehazeError, Result};
use crate::preprocess::RESAMPLE_FILTER;
use crate::types::{ImageTensor, OriginalDimensions, CHANNELS};

/// Scale a `[0, 1]` sample to 8 bits.
///
/// Out-of-range values saturate at 0 and 255, NaN becomes 0, and in-range
/// values truncate toward zero.
pub fn quantize_sample(value: f32) -> u8 {
    (value * 255.0).clamp(0.0, 255.0) as u8
}

/// Take batch element 0 of an NHWC tensor and convert it to 8-bit RGB.
pub fn tensor_to_image(output: &ImageTensor) -> Result<RgbImage> {
    let shape = output.shape();
    if shape[0] == 0 || shape[3] != CHANNELS {
        return Err(DehazeError::inference(format!(
            "unexpected output shape {shape:?}, expected (1, H, W, {CHANNELS})"
        )));
    }

    let (height, width) = (shape[1], shape[2]);
    let mut pixels = Vec::with_capacity(height * width * CHANNELS);
    for y in 0..height {
        for x in 0..width {
            for c in 0..CHANNELS {
                pixels.push(quantize_sample(output[[0, y, x, c]]));
            }
        }
    }

    RgbImage::from_raw(width as u32, height as u32, pixels).ok_or_else(|| {
        DehazeError::inference(format!("output buffer does not fit {width}x{height} RGB"))
    })
}

/// Bicubic resize to the recorded upload size. No-op when already there.
pub fn restore_dimensions(image: RgbImage, dims: OriginalDimensions) -> RgbImage {
    if image.dimensions() == (dims.width, dims.height) {
        return image;
    }
    imageops::resize(&image, dims.width, dims.height, RESAMPLE_FILTER)
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|source| DehazeError::Encode { source })?;
    Ok(buf.into_inner())
}

pub fn postprocess(output: &ImageTensor, dims: OriginalDimensions) -> Result<Vec<u8>> {
    let image = tensor_to_image(output)?;
    let restored = restore_dimensions(image, dims);
    encode_png(&restored)
}

/// Solid-colour helper used by tests across the crate.
#[cfg(test)]
pub(crate) fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, image::Rgb(rgb));
    encode_png(&image).expect("encode solid png")
}
