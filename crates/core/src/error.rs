//! Error taxonomy for the dehaze pipeline.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DehazeError {
    /// Upload is not a decodable image.
    #[error("failed to decode image: {reason}")]
    Decode { reason: String },

    /// Format was recognised but cannot be decoded or converted to RGB.
    #[error("unsupported image format: {reason}")]
    UnsupportedFormat { reason: String },

    #[error("model inference failed: {reason}")]
    Inference { reason: String },

    #[error("failed to encode PNG: {source}")]
    Encode {
        #[source]
        source: image::ImageError,
    },

    /// Model artifact missing, corrupt, or shaped differently than the pipeline expects.
    #[error("failed to load model {path}: {reason}")]
    Startup { path: PathBuf, reason: String },
}

impl DehazeError {
    pub fn inference(reason: impl Into<String>) -> Self {
        Self::Inference {
            reason: reason.into(),
        }
    }

    pub fn startup(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Startup {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True when the caller can fix the failure by sending a different upload.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::UnsupportedFormat { .. })
    }
}

impl From<ort::Error> for DehazeError {
    fn from(err: ort::Error) -> Self {
        Self::inference(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DehazeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_and_unsupported_are_client_errors() {
        let decode = DehazeError::Decode {
            reason: "bad bytes".to_string(),
        };
        let unsupported = DehazeError::UnsupportedFormat {
            reason: "avif".to_string(),
        };
        assert!(decode.is_client_error());
        assert!(unsupported.is_client_error());
    }

    #[test]
    fn inference_and_startup_are_server_errors() {
        assert!(!DehazeError::inference("shape mismatch").is_client_error());
        assert!(!DehazeError::startup("model.onnx", "missing").is_client_error());
    }

    #[test]
    fn startup_message_names_the_artifact() {
        let err = DehazeError::startup("models/aod.onnx", "file not found");
        let message = err.to_string();
        assert!(message.contains("models/aod.onnx"));
        assert!(message.contains("file not found"));
    }
}
