use std::fmt;

use ndarray::Array4;
use serde::{Deserialize, Serialize};

/// Spatial size the dehazing network was trained on.
pub const DEFAULT_INPUT_SIZE: u32 = 256;

/// RGB only; alpha is dropped during decode.
pub const CHANNELS: usize = 3;

/// `(1, H, W, 3)` float tensor with values in `[0, 1]`.
pub type ImageTensor = Array4<f32>;

/// Pixel size of the upload, captured right after decode and restored once at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalDimensions {
    pub width: u32,
    pub height: u32,
}

impl OriginalDimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for OriginalDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Memory layout the loaded model expects for its input tensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// Batch, height, width, channel. Keras-exported models use this.
    #[default]
    Nhwc,
    /// Batch, channel, height, width.
    Nchw,
}

impl TensorLayout {
    /// Guess the layout from a declared model input shape.
    ///
    /// A fixed `3` on axis 1 (and not on the last axis) means channel-first.
    /// Everything else, including fully dynamic shapes, is treated as NHWC.
    pub fn detect(shape: &[i64]) -> Self {
        if shape.len() == 4 && shape[1] == CHANNELS as i64 && shape[3] != CHANNELS as i64 {
            Self::Nchw
        } else {
            Self::Nhwc
        }
    }

    /// Shape a `(1, size, size, 3)` NHWC tensor takes in this layout.
    pub fn shape_for(self, size: usize) -> [usize; 4] {
        match self {
            Self::Nhwc => [1, size, size, CHANNELS],
            Self::Nchw => [1, CHANNELS, size, size],
        }
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nhwc => write!(f, "nhwc"),
            Self::Nchw => write!(f, "nchw"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_channel_first_shape() {
        assert_eq!(TensorLayout::detect(&[1, 3, 256, 256]), TensorLayout::Nchw);
        assert_eq!(TensorLayout::detect(&[-1, 3, -1, -1]), TensorLayout::Nchw);
    }

    #[test]
    fn detect_channel_last_shape() {
        assert_eq!(TensorLayout::detect(&[1, 256, 256, 3]), TensorLayout::Nhwc);
        assert_eq!(TensorLayout::detect(&[-1, -1, -1, 3]), TensorLayout::Nhwc);
    }

    #[test]
    fn ambiguous_and_dynamic_shapes_default_to_nhwc() {
        assert_eq!(TensorLayout::detect(&[1, 3, 3, 3]), TensorLayout::Nhwc);
        assert_eq!(TensorLayout::detect(&[-1, -1, -1, -1]), TensorLayout::Nhwc);
        assert_eq!(TensorLayout::detect(&[]), TensorLayout::Nhwc);
    }

    #[test]
    fn shape_for_matches_layout() {
        assert_eq!(TensorLayout::Nhwc.shape_for(256), [1, 256, 256, 3]);
        assert_eq!(TensorLayout::Nchw.shape_for(256), [1, 3, 256, 256]);
    }

    #[test]
    fn layout_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&TensorLayout::Nchw).expect("layout should serialize");
        assert_eq!(json, "\"nchw\"");
        let back: TensorLayout = serde_json::from_str("\"nhwc\"").expect("layout should parse");
        assert_eq!(back, TensorLayout::Nhwc);
    }

    #[test]
    fn dimensions_display_as_width_by_height() {
        assert_eq!(OriginalDimensions::new(4000, 3000).to_string(), "4000x3000");
    }
}
