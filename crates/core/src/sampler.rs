//! EDM second-order (Heun) sampler with patch-based denoising.
//!
//! Each step optionally re-noises the state ("churn"), takes an Euler step
//! from a denoiser evaluation at `t_hat`, and, except on the last step,
//! corrects it with a second evaluation at `t_next`. When the configured patch
//! is smaller than the image, every evaluation tiles the state, runs the
//! denoiser on the patch batch and fuses the result back.

use anyhow::{bail, Context, Result};
use ndarray::{concatenate, Array1, Array2, Array4, ArrayView4, Axis};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{EdmConfig, PatchConfig};
use crate::denoiser::{Denoiser, DenoiserInput};
use crate::fusion::fuse_batch;
use crate::geometry::PatchGeometry;
use crate::noise::NoiseSource;
use crate::resize::resize_bilinear;
use crate::schedule::karras_sigmas;
use crate::tiling::tile_batch;

/// Channel count of the broadcast sigma tensor expected by the reference networks.
pub const DEFAULT_SIGMA_CHANNELS: usize = 16;

/// Inputs of one sampling call.
pub struct SampleRequest<'a> {
    /// Standard-normal initial noise at full resolution.
    pub latents: ArrayView4<'a, f64>,
    /// Low-res conditioning, already upsampled to the full image size.
    pub img_lr: ArrayView4<'a, f64>,
    pub class_labels: Option<&'a Array2<f64>>,
    /// Mean high-res prediction, batch 1 or matching `img_lr`.
    pub mean_hr: Option<ArrayView4<'a, f64>>,
    pub lead_time_label: Option<&'a Array1<i64>>,
}

impl<'a> SampleRequest<'a> {
    pub fn new(latents: ArrayView4<'a, f64>, img_lr: ArrayView4<'a, f64>) -> Self {
        Self {
            latents,
            img_lr,
            class_labels: None,
            mean_hr: None,
            lead_time_label: None,
        }
    }
}

/// What a sampling call will do, without running the denoiser.
#[derive(Debug, Clone, Serialize)]
pub struct SamplingPlan {
    pub sigmas: Vec<f64>,
    pub geometry: PatchGeometry,
    pub tiled: bool,
    pub denoiser_calls: usize,
}

pub struct EdmSampler {
    edm: EdmConfig,
    patching: PatchConfig,
    sigma_channels: usize,
}

impl EdmSampler {
    pub fn new(edm: EdmConfig, patching: PatchConfig) -> Self {
        Self {
            edm,
            patching,
            sigma_channels: DEFAULT_SIGMA_CHANNELS,
        }
    }

    pub fn with_sigma_channels(mut self, sigma_channels: usize) -> Self {
        self.sigma_channels = sigma_channels;
        self
    }

    pub fn edm(&self) -> &EdmConfig {
        &self.edm
    }

    pub fn patching(&self) -> &PatchConfig {
        &self.patching
    }

    /// Noise schedule and tiling layout for `net`.
    pub fn plan<D: Denoiser + ?Sized>(&self, net: &D) -> Result<SamplingPlan> {
        self.plan_with(net.sigma_min(), |sigma| net.round_sigma(sigma))
    }

    /// Like [`EdmSampler::plan`] for a network known only by its minimum
    /// sigma and rounding rule.
    pub fn plan_with(
        &self,
        net_sigma_min: f64,
        round_sigma: impl Fn(f64) -> f64,
    ) -> Result<SamplingPlan> {
        let geometry = self.patching.geometry()?;
        if self.sigma_channels == 0 {
            bail!("sigma_channels must be positive");
        }

        let sigma_min = self.edm.sigma_min.max(net_sigma_min);
        let sigmas = karras_sigmas(
            self.edm.num_steps,
            sigma_min,
            self.edm.sigma_max,
            self.edm.rho,
            round_sigma,
        )
        .context("failed to build noise schedule")?;

        Ok(SamplingPlan {
            sigmas,
            geometry,
            tiled: !geometry.is_passthrough(),
            denoiser_calls: 2 * self.edm.num_steps - 1,
        })
    }

    /// Run the full sampling loop and return the denoised image.
    pub fn sample<D, N>(
        &self,
        net: &mut D,
        request: &SampleRequest<'_>,
        noise: &mut N,
    ) -> Result<Array4<f64>>
    where
        D: Denoiser + ?Sized,
        N: NoiseSource + ?Sized,
    {
        let plan = self.plan(&*net)?;
        let geometry = plan.geometry;
        let batch_size = validate_request(request, &geometry)?;

        info!(
            sigma_min = plan.sigmas[plan.sigmas.len() - 2],
            sigma_max = plan.sigmas[0],
            num_steps = self.edm.num_steps,
            tiled = plan.tiled,
            tiles_x = geometry.x.count,
            tiles_y = geometry.y.count,
            batch_size,
            "Starting EDM sampling"
        );

        let mut stepper = Stepper::prepare(
            net,
            request,
            geometry,
            plan.tiled,
            batch_size,
            self.sigma_channels,
        )?;

        let num_steps = self.edm.num_steps;
        let mut x_next = request.latents.mapv(|v| v * plan.sigmas[0]);

        for (i, pair) in plan.sigmas.windows(2).enumerate() {
            let (t_cur, t_next) = (pair[0], pair[1]);
            let x_cur = x_next;

            let gamma = if self.edm.s_min <= t_cur && t_cur <= self.edm.s_max {
                self.edm.s_churn / num_steps as f64
            } else {
                0.0
            };
            let t_hat = stepper.net.round_sigma(t_cur + gamma * t_cur);
            if t_hat <= 0.0 {
                bail!("noise level at step {i} rounded to {t_hat}");
            }

            let noise_scale = (t_hat * t_hat - t_cur * t_cur).max(0.0).sqrt() * self.edm.s_noise;
            let x_hat = if noise_scale > 0.0 {
                let eps = noise.standard_normal(x_cur.raw_dim());
                x_cur + &(eps * noise_scale)
            } else {
                x_cur
            };

            debug!(step = i, t_cur, t_hat, t_next, gamma, "EDM step");

            let denoised = stepper
                .denoise(&x_hat, t_hat)
                .with_context(|| format!("denoiser failed at step {i} (sigma {t_hat})"))?;
            let d_cur = (&x_hat - &denoised) / t_hat;
            x_next = &x_hat + &(&d_cur * (t_next - t_hat));

            if i < num_steps - 1 {
                let denoised = stepper
                    .denoise(&x_next, t_next)
                    .with_context(|| format!("denoiser failed at step {i} (sigma {t_next})"))?;
                let d_prime = (&x_next - &denoised) / t_next;
                x_next = &x_hat + &((&d_cur * 0.5 + &d_prime * 0.5) * (t_next - t_hat));
            }
        }

        Ok(x_next)
    }
}

/// Check shapes up front and return the batch size.
fn validate_request(request: &SampleRequest<'_>, geometry: &PatchGeometry) -> Result<usize> {
    let (b, _, h, w) = request.latents.dim();
    let img = geometry.image_shape();
    if (h, w) != (img.height, img.width) {
        bail!("latents are {h}x{w} but img_shape is {img}");
    }

    let (lr_b, _, lr_h, lr_w) = request.img_lr.dim();
    if lr_b != b {
        bail!("img_lr batch {lr_b} does not match latents batch {b}");
    }
    if (lr_h, lr_w) != (img.height, img.width) {
        bail!("img_lr is {lr_h}x{lr_w} but img_shape is {img}");
    }

    if let Some(mean_hr) = &request.mean_hr {
        let (m_b, _, m_h, m_w) = mean_hr.dim();
        if m_b != 1 && m_b != b {
            bail!("mean_hr batch {m_b} must be 1 or {b}");
        }
        if (m_h, m_w) != (img.height, img.width) {
            bail!("mean_hr is {m_h}x{m_w} but img_shape is {img}");
        }
    }

    Ok(lr_b)
}

/// Absolute `(row, column)` coordinates, shape `(batch, 2, H, W)`.
pub fn position_grid(batch: usize, height: usize, width: usize) -> Array4<i64> {
    Array4::from_shape_fn((batch, 2, height, width), |(_, axis, y, x)| {
        if axis == 0 {
            y as i64
        } else {
            x as i64
        }
    })
}

/// Denoiser wrapper that owns the per-call conditioning and hides tiling.
struct Stepper<'a, 'r, D: ?Sized> {
    net: &'a mut D,
    geometry: PatchGeometry,
    tiled: bool,
    batch_size: usize,
    sigma_channels: usize,
    x_lr: Array4<f64>,
    global_index: Array4<i64>,
    class_labels: Option<&'r Array2<f64>>,
    lead_time_label: Option<&'r Array1<i64>>,
}

impl<'a, 'r, D: Denoiser + ?Sized> Stepper<'a, 'r, D> {
    /// Build the conditioning once; it does not change between steps.
    fn prepare(
        net: &'a mut D,
        request: &SampleRequest<'r>,
        geometry: PatchGeometry,
        tiled: bool,
        batch_size: usize,
        sigma_channels: usize,
    ) -> Result<Self> {
        let img = geometry.image_shape();
        let grid = position_grid(request.latents.dim().0, img.height, img.width);

        let x_lr = match &request.mean_hr {
            Some(mean_hr) => {
                let mean_hr = mean_hr
                    .broadcast((batch_size, mean_hr.dim().1, img.height, img.width))
                    .context("mean_hr cannot be broadcast over the batch")?;
                concatenate(Axis(1), &[mean_hr, request.img_lr.view()])?
            }
            None => request.img_lr.to_owned(),
        };

        let (x_lr, global_index) = if tiled {
            let patch = geometry.patch_shape();
            let input_interp = resize_bilinear(&request.img_lr, patch.height, patch.width);
            let x_lr = tile_batch(&x_lr.view(), &geometry, batch_size, Some(&input_interp.view()))
                .context("failed to tile low-res conditioning")?;
            let global_index = tile_batch(&grid.view(), &geometry, batch_size, None)
                .context("failed to tile position grid")?;
            (x_lr, global_index)
        } else {
            (x_lr, grid)
        };

        Ok(Self {
            net,
            geometry,
            tiled,
            batch_size,
            sigma_channels,
            x_lr,
            global_index,
            class_labels: request.class_labels,
            lead_time_label: request.lead_time_label,
        })
    }

    /// One denoiser evaluation of the full-resolution state `x` at `sigma`.
    fn denoise(&mut self, x: &Array4<f64>, sigma: f64) -> Result<Array4<f64>> {
        let batch = if self.tiled {
            Some(tile_batch(&x.view(), &self.geometry, self.batch_size, None)?)
        } else {
            None
        };
        let x_in = batch.as_ref().map_or_else(|| x.view(), |b| b.view());

        let sigma_tensor = Array4::from_elem((x_in.dim().0, self.sigma_channels, 1, 1), sigma);
        let input = DenoiserInput {
            x: x_in.view(),
            x_lr: self.x_lr.view(),
            sigma: sigma_tensor.view(),
            class_labels: self.class_labels,
            lead_time_label: self.lead_time_label,
            global_index: Some(self.global_index.view()),
        };
        let denoised = self.net.denoise(&input)?;
        if denoised.shape() != x_in.shape() {
            bail!(
                "denoiser returned shape {:?}, expected {:?}",
                denoised.shape(),
                x_in.shape()
            );
        }

        if self.tiled {
            fuse_batch(&denoised.view(), &self.geometry, self.batch_size)
        } else {
            Ok(denoised)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Shape2;
    use crate::noise::GaussianNoise;
    use ndarray::Ix4;

    struct Identity;

    impl Denoiser for Identity {
        fn sigma_min(&self) -> f64 {
            0.0
        }

        fn denoise(&mut self, input: &DenoiserInput<'_>) -> Result<Array4<f64>> {
            Ok(input.x.to_owned())
        }
    }

    /// Always predicts a constant clean image.
    struct Constant(f64);

    impl Denoiser for Constant {
        fn sigma_min(&self) -> f64 {
            0.0
        }

        fn denoise(&mut self, input: &DenoiserInput<'_>) -> Result<Array4<f64>> {
            Ok(Array4::from_elem(input.x.raw_dim(), self.0))
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<(Vec<usize>, Vec<usize>, Vec<usize>, Option<Vec<usize>>, f64)>,
    }

    impl Denoiser for Recorder {
        fn sigma_min(&self) -> f64 {
            0.01
        }

        fn round_sigma(&self, sigma: f64) -> f64 {
            (sigma * 1000.0).round() / 1000.0
        }

        fn denoise(&mut self, input: &DenoiserInput<'_>) -> Result<Array4<f64>> {
            self.calls.push((
                input.x.shape().to_vec(),
                input.x_lr.shape().to_vec(),
                input.sigma.shape().to_vec(),
                input.global_index.as_ref().map(|g| g.shape().to_vec()),
                input.sigma_value(),
            ));
            Ok(input.x.to_owned())
        }
    }

    /// Counts calls that carried both label inputs.
    #[derive(Default)]
    struct LabelCounter {
        labelled: usize,
        total: usize,
    }

    impl Denoiser for LabelCounter {
        fn sigma_min(&self) -> f64 {
            0.0
        }

        fn denoise(&mut self, input: &DenoiserInput<'_>) -> Result<Array4<f64>> {
            self.total += 1;
            if input.class_labels.is_some_and(|l| l.dim() == (2, 3))
                && input.lead_time_label.is_some_and(|l| l.len() == 2)
            {
                self.labelled += 1;
            }
            Ok(input.x.to_owned())
        }
    }

    struct Failing;

    impl Denoiser for Failing {
        fn sigma_min(&self) -> f64 {
            0.0
        }

        fn denoise(&mut self, _input: &DenoiserInput<'_>) -> Result<Array4<f64>> {
            bail!("device lost")
        }
    }

    struct WrongShape;

    impl Denoiser for WrongShape {
        fn sigma_min(&self) -> f64 {
            0.0
        }

        fn denoise(&mut self, input: &DenoiserInput<'_>) -> Result<Array4<f64>> {
            let (n, c, h, w) = input.x.dim();
            Ok(Array4::zeros((n, c, h + 1, w)))
        }
    }

    fn edm(num_steps: usize) -> EdmConfig {
        EdmConfig {
            num_steps,
            sigma_max: 80.0,
            ..EdmConfig::default()
        }
    }

    fn patching(img: usize, patch: usize) -> PatchConfig {
        PatchConfig {
            img_shape: Shape2::square(img),
            patch_shape: Shape2::square(patch),
            overlap_pix: 2,
            boundary_pix: 1,
        }
    }

    fn latents(batch: usize, channels: usize, size: usize) -> Array4<f64> {
        GaussianNoise::seeded(3).standard_normal(Ix4(batch, channels, size, size))
    }

    #[test]
    fn plan_floors_sigma_min_to_network_minimum() {
        let sampler = EdmSampler::new(edm(5), patching(8, 8));
        let plan = sampler.plan(&Recorder::default()).expect("valid plan");
        assert_eq!(plan.sigmas.len(), 6);
        assert_eq!(plan.sigmas[4], 0.01);
        assert_eq!(plan.sigmas[5], 0.0);
        assert!(!plan.tiled);
        assert_eq!(plan.denoiser_calls, 9);
    }

    #[test]
    fn identity_denoiser_keeps_scaled_latents() {
        let sampler = EdmSampler::new(edm(3), patching(8, 8));
        let x0 = latents(1, 2, 8);
        let lr = Array4::<f64>::zeros((1, 1, 8, 8));
        let request = SampleRequest::new(x0.view(), lr.view());
        let out = sampler
            .sample(&mut Identity, &request, &mut GaussianNoise::seeded(0))
            .expect("sampling succeeds");
        let sigma_max = sampler.plan(&Identity).expect("valid plan").sigmas[0];
        assert!((sigma_max - 80.0).abs() < 1e-9);
        assert_eq!(out, x0.mapv(|v| v * sigma_max));
    }

    #[test]
    fn constant_denoiser_converges_to_constant_through_tiles() {
        let sampler = EdmSampler::new(edm(4), patching(14, 6));
        let x0 = latents(2, 1, 14);
        let lr = Array4::<f64>::zeros((2, 1, 14, 14));
        let request = SampleRequest::new(x0.view(), lr.view());
        let out = sampler
            .sample(&mut Constant(0.3), &request, &mut GaussianNoise::seeded(0))
            .expect("sampling succeeds");
        assert!(out.iter().all(|&v| (v - 0.3).abs() < 1e-9));
    }

    #[test]
    fn denoiser_sees_tiled_conditioning() {
        let sampler = EdmSampler::new(edm(3), patching(10, 6)).with_sigma_channels(4);
        let geometry = sampler.patching().geometry().expect("valid geometry");
        let x0 = latents(2, 3, 10);
        let lr = Array4::<f64>::ones((2, 2, 10, 10));
        let mean_hr = Array4::<f64>::ones((1, 3, 10, 10));
        let request = SampleRequest {
            mean_hr: Some(mean_hr.view()),
            ..SampleRequest::new(x0.view(), lr.view())
        };
        let mut net = Recorder::default();
        sampler
            .sample(&mut net, &request, &mut GaussianNoise::seeded(0))
            .expect("sampling succeeds");

        let rows = geometry.tile_count() * 2;
        assert_eq!(net.calls.len(), 5);
        for (x, x_lr, sigma, grid, _) in &net.calls {
            assert_eq!(x, &vec![rows, 3, 6, 6]);
            // mean_hr (3) + img_lr (2) + interpolated img_lr (2)
            assert_eq!(x_lr, &vec![rows, 7, 6, 6]);
            assert_eq!(sigma, &vec![rows, 4, 1, 1]);
            assert_eq!(grid.as_deref(), Some(&[rows, 2, 6, 6][..]));
        }

        let plan = sampler.plan(&net).expect("valid plan");
        let seen: Vec<f64> = net.calls.iter().map(|call| call.4).collect();
        let s = &plan.sigmas;
        assert_eq!(seen, vec![s[0], s[1], s[1], s[2], s[2]]);
    }

    fn sample_with_labels(sampler: &EdmSampler, net: &mut LabelCounter) -> Array4<f64> {
        let x0 = latents(2, 1, 10);
        let lr = Array4::<f64>::zeros((2, 1, 10, 10));
        let class_labels = Array2::<f64>::zeros((2, 3));
        let lead_time = Array1::from(vec![0_i64, 6]);
        let request = SampleRequest {
            class_labels: Some(&class_labels),
            lead_time_label: Some(&lead_time),
            ..SampleRequest::new(x0.view(), lr.view())
        };
        sampler
            .sample(net, &request, &mut GaussianNoise::seeded(0))
            .expect("sampling succeeds")
    }

    #[test]
    fn labels_reach_every_tiled_and_untiled_call() {
        for patch in [6, 10] {
            let sampler = EdmSampler::new(edm(3), patching(10, patch));
            let mut net = LabelCounter::default();
            let out = sample_with_labels(&sampler, &mut net);
            assert_eq!(out.dim(), (2, 1, 10, 10));
            assert_eq!(net.total, 5);
            assert_eq!(net.labelled, 5);
        }
    }

    #[test]
    fn untiled_call_gets_full_position_grid() {
        let sampler = EdmSampler::new(edm(1), patching(8, 8));
        let x0 = latents(1, 1, 8);
        let lr = Array4::<f64>::zeros((1, 1, 8, 8));
        let mut net = Recorder::default();
        sampler
            .sample(&mut net, &SampleRequest::new(x0.view(), lr.view()), &mut GaussianNoise::seeded(0))
            .expect("sampling succeeds");
        assert_eq!(net.calls.len(), 1);
        assert_eq!(net.calls[0].1, vec![1, 1, 8, 8]);
        assert_eq!(net.calls[0].3, Some(vec![1, 2, 8, 8]));
    }

    #[test]
    fn whole_image_patch_runs_with_default_margins() {
        let patching = PatchConfig {
            img_shape: Shape2::square(6),
            patch_shape: Shape2::square(6),
            ..PatchConfig::default()
        };
        let sampler = EdmSampler::new(edm(2), patching);
        let x0 = latents(1, 1, 6);
        let lr = Array4::<f64>::zeros((1, 1, 6, 6));
        let mut net = Recorder::default();
        sampler
            .sample(&mut net, &SampleRequest::new(x0.view(), lr.view()), &mut GaussianNoise::seeded(0))
            .expect("sampling succeeds");
        assert_eq!(net.calls.len(), 3);
        assert!(net.calls.iter().all(|call| call.0 == vec![1, 1, 6, 6]));
    }

    #[test]
    fn churn_injects_noise_only_inside_window() {
        let x0 = latents(1, 1, 8);
        let lr = Array4::<f64>::zeros((1, 1, 8, 8));
        let request = SampleRequest::new(x0.view(), lr.view());

        let calm = EdmSampler::new(edm(3), patching(8, 8));
        let churned = EdmSampler::new(
            EdmConfig {
                s_churn: 3.0,
                ..edm(3)
            },
            patching(8, 8),
        );
        let outside = EdmSampler::new(
            EdmConfig {
                s_churn: 3.0,
                s_max: 1e-3,
                ..edm(3)
            },
            patching(8, 8),
        );

        let run = |sampler: &EdmSampler| {
            sampler
                .sample(&mut Identity, &request, &mut GaussianNoise::seeded(11))
                .expect("sampling succeeds")
        };
        assert_eq!(run(&calm), run(&outside));
        assert_ne!(run(&calm), run(&churned));
    }

    #[test]
    fn denoiser_errors_propagate() {
        let sampler = EdmSampler::new(edm(2), patching(8, 8));
        let x0 = latents(1, 1, 8);
        let lr = Array4::<f64>::zeros((1, 1, 8, 8));
        let err = sampler
            .sample(&mut Failing, &SampleRequest::new(x0.view(), lr.view()), &mut GaussianNoise::seeded(0))
            .unwrap_err();
        assert!(format!("{err:#}").contains("device lost"));
    }

    #[test]
    fn wrong_denoiser_shape_is_rejected() {
        let sampler = EdmSampler::new(edm(2), patching(8, 8));
        let x0 = latents(1, 1, 8);
        let lr = Array4::<f64>::zeros((1, 1, 8, 8));
        let err = sampler
            .sample(&mut WrongShape, &SampleRequest::new(x0.view(), lr.view()), &mut GaussianNoise::seeded(0))
            .unwrap_err();
        assert!(format!("{err:#}").contains("denoiser returned shape"));
    }

    #[test]
    fn rejects_mismatched_request_shapes() {
        let sampler = EdmSampler::new(edm(2), patching(8, 8));
        let x0 = latents(1, 1, 8);
        let lr = Array4::<f64>::zeros((2, 1, 8, 8));
        assert!(sampler
            .sample(&mut Identity, &SampleRequest::new(x0.view(), lr.view()), &mut GaussianNoise::seeded(0))
            .is_err());

        let x0 = latents(1, 1, 9);
        let lr = Array4::<f64>::zeros((1, 1, 9, 9));
        assert!(sampler
            .sample(&mut Identity, &SampleRequest::new(x0.view(), lr.view()), &mut GaussianNoise::seeded(0))
            .is_err());
    }

    #[test]
    fn position_grid_holds_row_and_column() {
        let grid = position_grid(2, 3, 4);
        assert_eq!(grid.shape(), &[2, 2, 3, 4]);
        assert_eq!(grid[[1, 0, 2, 3]], 2);
        assert_eq!(grid[[1, 1, 2, 3]], 3);
    }
}
