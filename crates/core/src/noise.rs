//! Standard-normal noise for initial latents and stochastic churn.

use ndarray::{Array4, Ix4};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Source of i.i.d. standard-normal tensors.
pub trait NoiseSource {
    fn standard_normal(&mut self, shape: Ix4) -> Array4<f64>;
}

/// Seeded Gaussian noise; identical seeds give identical streams.
pub struct GaussianNoise {
    seed: u64,
    rng: ChaCha8Rng,
}

impl GaussianNoise {
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Seed drawn from the thread RNG. Log [`GaussianNoise::seed`] to make the
    /// run reproducible.
    pub fn from_entropy() -> Self {
        Self::seeded(rand::random())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl NoiseSource for GaussianNoise {
    fn standard_normal(&mut self, shape: Ix4) -> Array4<f64> {
        let rng = &mut self.rng;
        Array4::from_shape_simple_fn(shape, || StandardNormal.sample(rng))
    }
}
