//! Image dehazing: decode an upload, run the dehaze network, encode a PNG.

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod runtime;
pub mod server;
pub mod types;

pub use error::{DehazeError, Result};
pub use pipeline::{DehazeOutput, DehazePipeline};
