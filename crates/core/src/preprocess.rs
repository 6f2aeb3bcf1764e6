//! Decode & resize-in: uploaded bytes to a normalized `(1, S, S, 3)` tensor.

use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{ImageError, ImageReader, RgbImage};
use ndarray::Array4;

use crate::error::{DehazeError, Result};
use crate::types::{ImageTensor, OriginalDimensions, CHANNELS};

/// Bicubic filter used for every resample in the pipeline.
pub const RESAMPLE_FILTER: FilterType = FilterType::CatmullRom;

/// An upload decoded to 8-bit RGB, with its size recorded before any resizing.
#[derive(Debug)]
pub struct DecodedImage {
    pub pixels: RgbImage,
    pub dimensions: OriginalDimensions,
}

pub fn decode_image(bytes: &[u8]) -> Result<DecodedImage> {
    if bytes.is_empty() {
        return Err(DehazeError::Decode {
            reason: "upload is empty".to_string(),
        });
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| DehazeError::Decode {
            reason: e.to_string(),
        })?;

    if reader.format().is_none() {
        return Err(DehazeError::Decode {
            reason: "unrecognised image format".to_string(),
        });
    }

    let decoded = reader.decode().map_err(map_decode_error)?;
    let pixels = decoded.to_rgb8();
    let dimensions = OriginalDimensions::new(pixels.width(), pixels.height());

    if dimensions.width == 0 || dimensions.height == 0 {
        return Err(DehazeError::Decode {
            reason: format!("image has no pixels ({dimensions})"),
        });
    }

    Ok(DecodedImage { pixels, dimensions })
}

fn map_decode_error(err: ImageError) -> DehazeError {
    match err {
        ImageError::Unsupported(e) => DehazeError::UnsupportedFormat {
            reason: e.to_string(),
        },
        other => DehazeError::Decode {
            reason: other.to_string(),
        },
    }
}

/// Resize to `size x size`, scale to `[0, 1]` and prepend the batch axis.
pub fn to_input_tensor(image: &DecodedImage, size: u32) -> ImageTensor {
    let resized = if image.pixels.dimensions() == (size, size) {
        image.pixels.clone()
    } else {
        imageops::resize(&image.pixels, size, size, RESAMPLE_FILTER)
    };

    let side = size as usize;
    Array4::from_shape_fn((1, side, side, CHANNELS), |(_, y, x, c)| {
        f32::from(resized.get_pixel(x as u32, y as u32)[c]) / 255.0
    })
}

pub fn preprocess(bytes: &[u8], size: u32) -> Result<(ImageTensor, OriginalDimensions)> {
    let decoded = decode_image(bytes)?;
    let tensor = to_input_tensor(&decoded, size);
    Ok((tensor, decoded.dimensions))
}
