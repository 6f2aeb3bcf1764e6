//! Decode → infer → encode, run to completion for one upload.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::error::Result;
use crate::model::{DehazeModel, ModelInfo};
use crate::postprocess;
use crate::preprocess;
use crate::types::OriginalDimensions;

pub struct DehazeOutput {
    pub png: Vec<u8>,
    pub dimensions: OriginalDimensions,
}

/// Cheap to clone; all clones share one model handle.
#[derive(Clone)]
pub struct DehazePipeline {
    model: Arc<dyn DehazeModel>,
    input_size: u32,
}

impl DehazePipeline {
    pub fn new(model: Arc<dyn DehazeModel>, input_size: u32) -> Self {
        Self { model, input_size }
    }

    pub fn model_info(&self) -> ModelInfo {
        self.model.info()
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Blocking. Callers on an async runtime should use `spawn_blocking`.
    pub fn run(&self, bytes: &[u8]) -> Result<DehazeOutput> {
        let started = Instant::now();

        let (input, dimensions) = preprocess::preprocess(bytes, self.input_size)?;
        let decoded_at = Instant::now();
        debug!(
            upload_bytes = bytes.len(),
            original = %dimensions,
            elapsed_ms = decoded_at.duration_since(started).as_millis() as u64,
            "Decoded upload"
        );

        let output = self.model.predict(&input)?;
        let inferred_at = Instant::now();
        debug!(
            elapsed_ms = inferred_at.duration_since(decoded_at).as_millis() as u64,
            "Inference finished"
        );

        let png = postprocess::postprocess(&output, dimensions)?;
        debug!(
            png_bytes = png.len(),
            elapsed_ms = inferred_at.elapsed().as_millis() as u64,
            "Encoded result"
        );

        info!(
            original = %dimensions,
            png_bytes = png.len(),
            total_ms = started.elapsed().as_millis() as u64,
            "Dehazed image"
        );

        Ok(DehazeOutput { png, dimensions })
    }
}
