//! Macenko stain normalization for H&E histopathology tiles.
//!
//! The numeric core is [`macenko_normalize`] / [`StainNormalizer`]; the rest
//! of the crate is the file I/O, batch driver and metrics around it.

pub mod color_conversion;
pub mod color_deconvolution;
pub mod config;
pub mod error;
pub mod float_trait;
pub mod image_io;
pub mod linalg;
pub mod logger;
pub mod macenko_normalize;
pub mod metrics;
pub mod pipeline;
pub mod rgb_separate_stains_macenko_pca;
pub mod separate_stains_macenko_pca;
pub mod utils;

#[cfg(feature = "python")]
mod python;

pub use config::{DatasetConfig, PipelineConfig, ProcessingConfig};
pub use error::{NormalizeError, Result};
pub use float_trait::MacenkoFloat;
pub use macenko_normalize::{
    macenko_normalize, MacenkoParams, NormalizeOutcome, Normalized, StainNormalizer,
};
pub use separate_stains_macenko_pca::{StainEstimate, StainSeparation};
