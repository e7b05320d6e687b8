//! Karras power-law noise-level discretisation.

use anyhow::{bail, Result};

/// Noise levels `sigma_0 > sigma_1 > ... > sigma_{n-1} > sigma_n = 0`.
///
/// `sigma_i = ((1 - r) * max^(1/rho) + r * min^(1/rho))^rho` with `r = i/(n-1)`; each
/// level is passed through `round_sigma` before the terminal zero is appended.
/// A single-step schedule is `[sigma_max, 0]`.
pub fn karras_sigmas(
    num_steps: usize,
    sigma_min: f64,
    sigma_max: f64,
    rho: f64,
    round_sigma: impl Fn(f64) -> f64,
) -> Result<Vec<f64>> {
    if num_steps == 0 {
        bail!("num_steps must be at least 1");
    }
    if !(sigma_min.is_finite() && sigma_min > 0.0) {
        bail!("sigma_min must be a positive finite number, got {sigma_min}");
    }
    if !(sigma_max.is_finite() && sigma_max > sigma_min) {
        bail!("sigma_max ({sigma_max}) must be finite and greater than sigma_min ({sigma_min})");
    }
    if !(rho.is_finite() && rho > 0.0) {
        bail!("rho must be a positive finite number, got {rho}");
    }

    let max_inv_rho = sigma_max.powf(1.0 / rho);
    let min_inv_rho = sigma_min.powf(1.0 / rho);
    let denom = (num_steps - 1).max(1) as f64;

    let mut sigmas: Vec<f64> = (0..num_steps)
        .map(|i| {
            let ramp = i as f64 / denom;
            round_sigma(((1.0 - ramp) * max_inv_rho + ramp * min_inv_rho).powf(rho))
        })
        .collect();
    sigmas.push(0.0);
    Ok(sigmas)
}
