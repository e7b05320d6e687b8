//! Core crate for patch-based diffusion super-resolution: tiling, fusion and
//! the EDM sampler.

pub mod config;
pub mod denoiser;
pub mod fusion;
pub mod geometry;
pub mod logging;
pub mod noise;
pub mod onnx;
pub mod resize;
pub mod runtime;
pub mod sampler;
pub mod schedule;
pub mod tiling;

pub use denoiser::{Denoiser, DenoiserInput};
pub use geometry::{PatchGeometry, Shape2};
pub use noise::{GaussianNoise, NoiseSource};
pub use sampler::{EdmSampler, SampleRequest, SamplingPlan};
