//! Two-stream video GAN on Burn.
//!
//! The generator draws a static background frame and a moving foreground with
//! a per-pixel mask from one latent code, then alpha-composites them. A 3D
//! convolutional discriminator scores real and generated clips with a single
//! shared parameter set.

pub mod data;
pub mod error;
pub mod model;
pub mod training;
pub mod utils;

pub use error::{ModelError, ModelResult};
pub use model::{ModelConfig, VideoGan};
