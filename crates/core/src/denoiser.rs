//! Contract between the sampler and the denoising network.

use anyhow::Result;
use ndarray::{Array1, Array2, Array4, ArrayView4};

/// Everything a denoiser sees for one forward pass.
///
/// When tiling is active `x`, `x_lr` and `global_index` are patch batches that
/// share the same leading layout; otherwise they are full images.
pub struct DenoiserInput<'a> {
    /// Noisy batch.
    pub x: ArrayView4<'a, f64>,
    /// Low-res conditioning, plus the interpolated low-res channels when tiled.
    pub x_lr: ArrayView4<'a, f64>,
    /// Current noise level broadcast to `(rows, sigma_channels, 1, 1)`.
    pub sigma: ArrayView4<'a, f64>,
    pub class_labels: Option<&'a Array2<f64>>,
    pub lead_time_label: Option<&'a Array1<i64>>,
    /// Absolute `(row, column)` of every pixel, laid out like `x`.
    pub global_index: Option<ArrayView4<'a, i64>>,
}

impl DenoiserInput<'_> {
    /// Scalar noise level of this call.
    pub fn sigma_value(&self) -> f64 {
        self.sigma.iter().next().copied().unwrap_or(0.0)
    }
}

/// A denoising network as seen by the sampler.
///
/// Implementations are free to run on any backend; they only need to return a
/// batch shaped exactly like `input.x`.
pub trait Denoiser {
    /// Smallest noise level the network supports.
    fn sigma_min(&self) -> f64;

    /// Snap a continuous noise level to one the network supports.
    fn round_sigma(&self, sigma: f64) -> f64 {
        sigma
    }

    fn denoise(&mut self, input: &DenoiserInput<'_>) -> Result<Array4<f64>>;
}

impl<D: Denoiser + ?Sized> Denoiser for Box<D> {
    fn sigma_min(&self) -> f64 {
        (**self).sigma_min()
    }

    fn round_sigma(&self, sigma: f64) -> f64 {
        (**self).round_sigma(sigma)
    }

    fn denoise(&mut self, input: &DenoiserInput<'_>) -> Result<Array4<f64>> {
        (**self).denoise(input)
    }
}
