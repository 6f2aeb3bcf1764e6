//! The dehazing network: a trait seam plus the ONNX Runtime implementation.

use std::path::PathBuf;
use std::sync::Mutex;

use ndarray::Ix4;
use ort::{session::Session, value::Tensor};
use serde::Serialize;
use tracing::{debug, info};

use crate::backend::{build_session, InferenceBackend, SessionConfig};
use crate::config::ModelConfig;
use crate::error::{DehazeError, Result};
use crate::types::{ImageTensor, TensorLayout, CHANNELS};

/// Description of the loaded model, served at `GET /api/model`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub path: PathBuf,
    pub backend: InferenceBackend,
    pub layout: TensorLayout,
    pub input_name: String,
    pub output_name: String,
    pub input_size: u32,
    /// Declared input dimensions, `-1` for dynamic axes.
    pub declared_input_shape: Vec<i64>,
}

/// A pretrained image-to-image network.
///
/// `predict` receives a `(1, S, S, 3)` NHWC tensor and must return a tensor of
/// the same shape. Implementations are shared across requests and never
/// mutate their weights.
pub trait DehazeModel: Send + Sync {
    fn predict(&self, input: &ImageTensor) -> Result<ImageTensor>;

    fn info(&self) -> ModelInfo;
}

pub struct OnnxDehazeModel {
    session: Mutex<Session>,
    info: ModelInfo,
}

impl OnnxDehazeModel {
    /// Load the artifact and check that its IO is compatible with `(1, S, S, 3)`.
    pub fn load(config: &ModelConfig) -> Result<Self> {
        let path = config.path.clone();
        if !path.is_file() {
            return Err(DehazeError::startup(&path, "model artifact not found"));
        }

        debug!(
            model = %path.display(),
            backend = %config.backend,
            input_size = config.input_size,
            "Loading ONNX dehaze model"
        );

        let session = build_session(&SessionConfig {
            model_path: &path,
            backend: config.backend,
            trt_cache_dir: Some(config.trt_cache_dir.as_path()),
        })
        .map_err(|e| DehazeError::startup(&path, format!("{e:#}")))?;

        let (Some(input), Some(output)) = (session.inputs().first(), session.outputs().first())
        else {
            return Err(DehazeError::startup(&path, "model declares no inputs or outputs"));
        };
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();

        let declared_input_shape = match input.dtype() {
            ort::value::ValueType::Tensor { ty, shape, .. } => {
                if *ty != ort::tensor::TensorElementType::Float32 {
                    return Err(DehazeError::startup(
                        &path,
                        format!("input '{input_name}' is {ty:?}, expected float32"),
                    ));
                }
                shape.iter().copied().collect::<Vec<i64>>()
            }
            other => {
                return Err(DehazeError::startup(
                    &path,
                    format!("input '{input_name}' is not a tensor: {other:?}"),
                ))
            }
        };

        let layout = TensorLayout::detect(&declared_input_shape);
        check_declared_shape(&declared_input_shape, layout, config.input_size)
            .map_err(|reason| DehazeError::startup(&path, reason))?;

        let info = ModelInfo {
            path,
            backend: config.backend,
            layout,
            input_name,
            output_name,
            input_size: config.input_size,
            declared_input_shape,
        };

        info!(
            input = %info.input_name,
            output = %info.output_name,
            layout = %info.layout,
            shape = ?info.declared_input_shape,
            "Detected model IO"
        );

        Ok(Self {
            session: Mutex::new(session),
            info,
        })
    }
}

impl DehazeModel for OnnxDehazeModel {
    fn predict(&self, input: &ImageTensor) -> Result<ImageTensor> {
        let feed = match self.info.layout {
            TensorLayout::Nhwc => input.clone(),
            TensorLayout::Nchw => input
                .view()
                .permuted_axes([0, 3, 1, 2])
                .as_standard_layout()
                .into_owned(),
        };
        let input_tensor = Tensor::from_array(feed)?;

        let raw = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| DehazeError::inference("session lock poisoned"))?;
            let outputs =
                session.run(ort::inputs![self.info.input_name.as_str() => &input_tensor])?;
            let output_view =
                outputs[self.info.output_name.as_str()].try_extract_array::<f32>()?;
            output_view.to_owned()
        };

        let raw = raw
            .into_dimensionality::<Ix4>()
            .map_err(|e| DehazeError::inference(format!("output is not 4-D: {e}")))?;

        let output = match self.info.layout {
            TensorLayout::Nhwc => raw,
            TensorLayout::Nchw => raw
                .permuted_axes([0, 2, 3, 1])
                .as_standard_layout()
                .into_owned(),
        };

        if output.shape() != input.shape() {
            return Err(DehazeError::inference(format!(
                "output shape {:?} does not match input shape {:?}",
                output.shape(),
                input.shape()
            )));
        }

        Ok(output)
    }

    fn info(&self) -> ModelInfo {
        self.info.clone()
    }
}

/// Reject declared input shapes whose fixed axes disagree with `(1, S, S, 3)`.
fn check_declared_shape(
    declared: &[i64],
    layout: TensorLayout,
    input_size: u32,
) -> std::result::Result<(), String> {
    if declared.is_empty() {
        return Ok(());
    }
    if declared.len() != 4 {
        return Err(format!(
            "input has rank {}, expected 4 ({declared:?})",
            declared.len()
        ));
    }

    let expected = layout.shape_for(input_size as usize);
    for (axis, (&got, &want)) in declared.iter().zip(expected.iter()).enumerate() {
        if got > 0 && got as usize != want {
            return Err(format!(
                "input axis {axis} is fixed to {got}, pipeline feeds {want} ({layout} {expected:?}, {CHANNELS} channels)"
            ));
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_shapes_are_accepted() {
        assert!(check_declared_shape(&[-1, -1, -1, 3], TensorLayout::Nhwc, 256).is_ok());
        assert!(check_declared_shape(&[-1, 3, -1, -1], TensorLayout::Nchw, 256).is_ok());
        assert!(check_declared_shape(&[], TensorLayout::Nhwc, 256).is_ok());
    }

    #[test]
    fn fixed_matching_shape_is_accepted() {
        assert!(check_declared_shape(&[1, 256, 256, 3], TensorLayout::Nhwc, 256).is_ok());
        assert!(check_declared_shape(&[1, 3, 256, 256], TensorLayout::Nchw, 256).is_ok());
    }

    #[test]
    fn fixed_mismatched_size_is_rejected() {
        let err = check_declared_shape(&[1, 512, 512, 3], TensorLayout::Nhwc, 256).unwrap_err();
        assert!(err.contains("axis 1"));
    }

    #[test]
    fn wrong_rank_is_rejected() {
        let err = check_declared_shape(&[256, 256, 3], TensorLayout::Nhwc, 256).unwrap_err();
        assert!(err.contains("rank 3"));
    }

    #[test]
    fn missing_artifact_is_a_startup_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ModelConfig {
            path: dir.path().join("absent.onnx"),
            ..ModelConfig::default()
        };

        match OnnxDehazeModel::load(&config) {
            Err(DehazeError::Startup { path, reason }) => {
                assert_eq!(path, dir.path().join("absent.onnx"));
                assert!(reason.contains("not found"));
            }
            Err(other) => panic!("expected startup error, got {other}"),
            Ok(_) => panic!("expected startup error, got a model"),
        }
    }
}
