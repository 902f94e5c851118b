//! Discrete-time Gaussian diffusion with correlated noise.
//!
//! The forward and reverse processes are the usual DDPM ones; the only change
//! is where the noise comes from. Every `ε` below is drawn from a
//! [`CorrelationField`], so each feature dimension is corrupted by noise whose
//! temporal covariance is that dimension's GP kernel.
//!
//! ```text
//! q(x_t | x_0)        x_t = sqrt(ᾱ_t) x_0 + sqrt(1 - ᾱ_t) ε
//! p(x_{t-1} | x_t)    x_{t-1} = μ̃_t(x̂_0, x_t) + 1[t > 0] · exp(½ log σ²_t) ε
//! ```
//!
//! - [`schedule`]: beta schedules and derived coefficients
//! - [`resample`]: training timestep samplers
//! - [`guidance`]: classifier-free guidance wrapper

pub mod guidance;
pub mod resample;
pub mod schedule;

use candle_core::{D, DType, Device, Tensor};
use rand_chacha::ChaCha8Rng;

use crate::config::{DiffusionConfig, ModelMeanType, ModelVarType};
use crate::noise::{CorrelationField, NoiseSource};
use crate::{Error, Result};

pub use guidance::ClassifierFreeGuidance;
pub use resample::{LossSecondMomentResampler, ScheduleSampler, UniformSampler, create_sampler};
pub use schedule::NoiseSchedule;

/// Conditioning passed alongside the noisy motion.
#[derive(Debug, Clone)]
pub struct Conditioning {
    /// Valid-frame mask `[b, 1, 1, f]` (1.0 = valid). `None` means every frame.
    pub mask: Option<Tensor>,
    /// Valid length of each sequence, in frames.
    pub lengths: Vec<usize>,
    /// Text or action embedding `[b, cond_dim]`.
    pub embedding: Option<Tensor>,
    /// Classifier-free guidance scale.
    pub guidance_scale: Option<f64>,
}

impl Conditioning {
    /// Every frame valid, no embedding.
    pub fn full(batch: usize, frames: usize) -> Self {
        Self {
            mask: None,
            lengths: vec![frames; batch],
            embedding: None,
            guidance_scale: None,
        }
    }

    /// Mask frames past each sequence's length.
    pub fn from_lengths(lengths: &[usize], frames: usize, device: &Device) -> Result<Self> {
        if let Some(&bad) = lengths.iter().find(|&&l| l == 0 || l > frames) {
            return Err(Error::Config(format!(
                "sequence length {bad} outside 1..={frames}"
            )));
        }
        let mask: Vec<f32> = lengths
            .iter()
            .flat_map(|&l| (0..frames).map(move |f| if f < l { 1.0 } else { 0.0 }))
            .collect();
        Ok(Self {
            mask: Some(Tensor::from_vec(mask, (lengths.len(), 1, 1, frames), device)?),
            lengths: lengths.to_vec(),
            embedding: None,
            guidance_scale: None,
        })
    }

    pub fn with_embedding(mut self, embedding: Tensor) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_guidance(mut self, scale: f64) -> Self {
        self.guidance_scale = Some(scale);
        self
    }

    /// The unconditional counterpart: same mask, no embedding, no guidance.
    pub fn without_embedding(&self) -> Self {
        Self {
            mask: self.mask.clone(),
            lengths: self.lengths.clone(),
            embedding: None,
            guidance_scale: None,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }
}

/// A denoiser usable by [`GaussianDiffusion`].
///
/// Receives `x_t [b, c, j, f]`, the timestep of each sample as f32 `[b]`, the
/// conditioning and the active correlation field (whose per-dimension
/// `lengths` are part of the model input). Returns a tensor of the input
/// shape: `ε` or `x̂_0` depending on [`ModelMeanType`].
pub trait ScoreModel {
    fn forward(
        &self,
        x_t: &Tensor,
        timesteps: &Tensor,
        cond: &Conditioning,
        field: &CorrelationField,
    ) -> Result<Tensor>;
}

impl<M: ScoreModel + ?Sized> ScoreModel for &M {
    fn forward(
        &self,
        x_t: &Tensor,
        timesteps: &Tensor,
        cond: &Conditioning,
        field: &CorrelationField,
    ) -> Result<Tensor> {
        (**self).forward(x_t, timesteps, cond, field)
    }
}

/// Per-sample training losses, `[b]` each.
#[derive(Debug, Clone)]
pub struct Losses {
    pub loss: Tensor,
    pub mse: Tensor,
}

/// Options of [`GaussianDiffusion::p_sample_loop`].
#[derive(Debug, Clone, Default)]
pub struct SampleOptions {
    /// Start this many steps below `T - 1`.
    pub skip_timesteps: usize,
    /// Starting `x_T`, instead of a draw from the field.
    pub noise: Option<Tensor>,
    /// Motion to re-noise to the starting step (editing). Needs `skip_timesteps`.
    pub init_motion: Option<Tensor>,
    /// Reuse one noise draw for every reverse step.
    pub const_noise: bool,
    /// Clamp `x̂_0` to `[-1, 1]`.
    pub clip_denoised: bool,
}

/// Reverse-step distribution and the `x̂_0` it came from.
#[derive(Debug, Clone)]
pub struct MeanVariance {
    pub mean: Tensor,
    pub variance: Tensor,
    pub log_variance: Tensor,
    pub pred_xstart: Tensor,
}

#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    schedule: NoiseSchedule,
    mean_type: ModelMeanType,
    var_type: ModelVarType,
}

impl GaussianDiffusion {
    pub fn new(config: &DiffusionConfig) -> Result<Self> {
        Ok(Self {
            schedule: NoiseSchedule::new(config.beta_schedule, config.num_timesteps)?,
            mean_type: config.mean_type,
            var_type: config.var_type,
        })
    }

    pub fn from_schedule(
        schedule: NoiseSchedule,
        mean_type: ModelMeanType,
        var_type: ModelVarType,
    ) -> Self {
        Self {
            schedule,
            mean_type,
            var_type,
        }
    }

    pub fn num_timesteps(&self) -> usize {
        self.schedule.num_timesteps()
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn mean_type(&self) -> ModelMeanType {
        self.mean_type
    }

    /// Gather `coeffs[t_i]` into `[b, 1, ..., 1]` matching the rank of `like`.
    fn extract(&self, coeffs: &[f64], t: &[usize], like: &Tensor) -> Result<Tensor> {
        let values = t
            .iter()
            .map(|&t| {
                coeffs.get(t).map(|&c| c as f32).ok_or_else(|| {
                    Error::Config(format!("timestep {t} outside 0..{}", coeffs.len()))
                })
            })
            .collect::<Result<Vec<f32>>>()?;
        let mut shape = vec![1usize; like.rank()];
        shape[0] = t.len();
        Ok(Tensor::from_vec(values, shape, like.device())?.to_dtype(like.dtype())?)
    }

    /// Corrupt `x0` to step `t` with the given noise.
    pub fn q_sample(&self, x0: &Tensor, t: &[usize], noise: &Tensor) -> Result<Tensor> {
        let a = self.extract(self.schedule.sqrt_alphas_cumprod(), t, x0)?;
        let s = self.extract(self.schedule.sqrt_one_minus_alphas_cumprod(), t, x0)?;
        Ok((x0.broadcast_mul(&a)? + noise.broadcast_mul(&s)?)?)
    }

    /// Mean of `q(x_{t-1} | x_t, x_0)`.
    pub fn q_posterior_mean(&self, x0: &Tensor, x_t: &Tensor, t: &[usize]) -> Result<Tensor> {
        let c1 = self.extract(self.schedule.posterior_mean_coef1(), t, x_t)?;
        let c2 = self.extract(self.schedule.posterior_mean_coef2(), t, x_t)?;
        Ok((x0.broadcast_mul(&c1)? + x_t.broadcast_mul(&c2)?)?)
    }

    pub fn predict_xstart_from_eps(&self, x_t: &Tensor, t: &[usize], eps: &Tensor) -> Result<Tensor> {
        let a = self.extract(self.schedule.sqrt_recip_alphas_cumprod(), t, x_t)?;
        let b = self.extract(self.schedule.sqrt_recipm1_alphas_cumprod(), t, x_t)?;
        Ok((x_t.broadcast_mul(&a)? - eps.broadcast_mul(&b)?)?)
    }

    fn timestep_tensor(t: &[usize], device: &Device) -> Result<Tensor> {
        let values: Vec<f32> = t.iter().map(|&t| t as f32).collect();
        Ok(Tensor::from_vec(values, t.len(), device)?)
    }

    fn run_model<M: ScoreModel + ?Sized>(
        model: &M,
        x_t: &Tensor,
        t: &[usize],
        cond: &Conditioning,
        field: &CorrelationField,
    ) -> Result<Tensor> {
        let timesteps = Self::timestep_tensor(t, x_t.device())?;
        let out = model.forward(x_t, &timesteps, cond, field)?;
        if out.dims() != x_t.dims() {
            return Err(Error::ShapeMismatch {
                expected: x_t.dims().to_vec(),
                actual: out.dims().to_vec(),
            });
        }
        Ok(out)
    }

    /// Masked MSE training loss at timesteps `t`, one value per sample.
    pub fn training_losses<M: ScoreModel + ?Sized>(
        &self,
        model: &M,
        x0: &Tensor,
        t: &[usize],
        cond: &Conditioning,
        field: &CorrelationField,
        rng: &mut ChaCha8Rng,
    ) -> Result<Losses> {
        if t.len() != x0.dim(0)? {
            return Err(Error::ShapeMismatch {
                expected: vec![x0.dim(0)?],
                actual: vec![t.len()],
            });
        }
        let noise = field.sample(x0.dims(), rng)?.to_dtype(x0.dtype())?;
        let x_t = self.q_sample(x0, t, &noise)?;
        let out = Self::run_model(model, &x_t, t, cond, field)?;

        let target = match self.mean_type {
            ModelMeanType::Epsilon => &noise,
            ModelMeanType::StartX => x0,
        };
        let mse = masked_mse(target, &out, cond.mask.as_ref())?;
        Ok(Losses {
            loss: mse.clone(),
            mse,
        })
    }

    /// Model prediction turned into `p(x_{t-1} | x_t)`.
    pub fn p_mean_variance<M: ScoreModel + ?Sized>(
        &self,
        model: &M,
        x: &Tensor,
        t: &[usize],
        cond: &Conditioning,
        field: &CorrelationField,
        clip_denoised: bool,
    ) -> Result<MeanVariance> {
        let out = Self::run_model(model, x, t, cond, field)?;

        let (variance, log_variance) = match self.var_type {
            ModelVarType::FixedSmall => (
                self.schedule.posterior_variance(),
                self.schedule.posterior_log_variance_clipped(),
            ),
            ModelVarType::FixedLarge => (
                self.schedule.large_variance(),
                self.schedule.large_log_variance(),
            ),
        };
        let variance = self.extract(variance, t, x)?;
        let log_variance = self.extract(log_variance, t, x)?;

        let pred_xstart = match self.mean_type {
            ModelMeanType::StartX => out,
            ModelMeanType::Epsilon => self.predict_xstart_from_eps(x, t, &out)?,
        };
        let pred_xstart = if clip_denoised {
            pred_xstart.clamp(-1f32, 1f32)?
        } else {
            pred_xstart
        };
        let mean = self.q_posterior_mean(&pred_xstart, x, t)?;

        Ok(MeanVariance {
            mean,
            variance,
            log_variance,
            pred_xstart,
        })
    }

    /// One reverse step from `x` at step `t`. No noise is added at `t = 0`.
    pub fn p_sample<M: ScoreModel + ?Sized>(
        &self,
        model: &M,
        x: &Tensor,
        t: usize,
        cond: &Conditioning,
        field: &CorrelationField,
        noise: &Tensor,
        clip_denoised: bool,
    ) -> Result<(Tensor, Tensor)> {
        let steps = vec![t; x.dim(0)?];
        let out = self.p_mean_variance(model, x, &steps, cond, field, clip_denoised)?;
        let sample = if t == 0 {
            out.mean
        } else {
            let std = (out.log_variance * 0.5)?.exp()?;
            (out.mean + noise.broadcast_mul(&std)?)?
        };
        Ok((sample, out.pred_xstart))
    }

    /// Full reverse process from `x_T` to `x_0` for a batch of `shape`.
    pub fn p_sample_loop<M: ScoreModel + ?Sized>(
        &self,
        model: &M,
        shape: &[usize],
        cond: &Conditioning,
        field: &CorrelationField,
        opts: &SampleOptions,
        rng: &mut ChaCha8Rng,
    ) -> Result<Tensor> {
        let num_timesteps = self.num_timesteps();
        if opts.skip_timesteps >= num_timesteps {
            return Err(Error::Config(format!(
                "skip_timesteps {} leaves no steps out of {num_timesteps}",
                opts.skip_timesteps
            )));
        }
        let start = num_timesteps - 1 - opts.skip_timesteps;

        let mut x = match &opts.noise {
            Some(noise) => {
                if noise.dims() != shape {
                    return Err(Error::ShapeMismatch {
                        expected: shape.to_vec(),
                        actual: noise.dims().to_vec(),
                    });
                }
                noise.clone()
            }
            None => field.sample(shape, rng)?,
        };
        if let Some(init) = &opts.init_motion {
            if opts.skip_timesteps == 0 {
                tracing::warn!("init_motion without skip_timesteps is replaced by pure noise");
            } else {
                x = self.q_sample(init, &vec![start; shape[0]], &x)?;
            }
        }

        let fixed = if opts.const_noise {
            Some(field.sample(shape, rng)?)
        } else {
            None
        };

        tracing::info!(steps = start + 1, shape = ?shape, "sampling");
        for t in (0..=start).rev() {
            let noise = match &fixed {
                Some(noise) => noise.clone(),
                None => field.sample(shape, rng)?,
            };
            let (next, _) = self.p_sample(model, &x, t, cond, field, &noise, opts.clip_denoised)?;
            x = next.detach();
            tracing::debug!(t, "reverse step");
        }
        Ok(x)
    }
}

/// Squared error averaged over valid frames and all features: `[b]`.
pub fn masked_mse(target: &Tensor, pred: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    let sq = (target - pred)?.sqr()?;
    let b = sq.dim(0)?;
    match mask {
        None => Ok(sq.reshape((b, ()))?.mean(D::Minus1)?),
        Some(mask) => {
            let mask = mask.to_dtype(sq.dtype())?;
            let features: usize = sq.dims()[1..sq.rank() - 1].iter().product();
            let num = sq.broadcast_mul(&mask)?.reshape((b, ()))?.sum(D::Minus1)?;
            let valid = (mask.reshape((b, ()))?.sum(D::Minus1)? * features as f64)?;
            Ok((num / valid.maximum(1e-8)?)?)
        }
    }
}

/// Mean, standard deviation and finiteness of a generated batch.
pub fn summarize(x: &Tensor) -> Result<(f32, f32, bool)> {
    let x = x.to_dtype(DType::F32)?.flatten_all()?;
    let mean: f32 = x.mean_all()?.to_scalar()?;
    let var: f32 = x.affine(1.0, -(mean as f64))?.sqr()?.mean_all()?.to_scalar()?;
    let values: Vec<f32> = x.to_vec1()?;
    Ok((mean, var.sqrt(), values.iter().all(|v| v.is_finite())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BetaSchedule, KernelConfig};
    use crate::kernel::KernelBank;
    use crate::noise::{CorrMode, CorrelationAssignment};
    use rand::SeedableRng;

    /// Predicts `scale · x_t`.
    struct Affine(f64);

    impl ScoreModel for Affine {
        fn forward(
            &self,
            x_t: &Tensor,
            _timesteps: &Tensor,
            _cond: &Conditioning,
            _field: &CorrelationField,
        ) -> Result<Tensor> {
            Ok((x_t * self.0)?)
        }
    }

    /// Drops the last frame.
    struct Truncating;

    impl ScoreModel for Truncating {
        fn forward(
            &self,
            x_t: &Tensor,
            _timesteps: &Tensor,
            _cond: &Conditioning,
            _field: &CorrelationField,
        ) -> Result<Tensor> {
            let f = x_t.dim(3)?;
            Ok(x_t.narrow(3, 0, f - 1)?)
        }
    }

    fn field(dims: usize, frames: usize, mode: Option<CorrMode>) -> CorrelationField {
        let config = KernelConfig {
            num_frames: frames,
            fps: None,
            dims,
            gain: 1.0,
            length_scales: vec![0.05, 0.5],
            ..Default::default()
        };
        let bank = KernelBank::from_config(&config, &Device::Cpu).unwrap();
        let assignment = match mode {
            Some(mode) => mode.assignment(&bank, 1, 0.03).unwrap(),
            None => CorrelationAssignment::template(dims, 0.03),
        };
        CorrelationField::new(&bank, &assignment, &Device::Cpu).unwrap()
    }

    fn diffusion(steps: usize, mean_type: ModelMeanType) -> GaussianDiffusion {
        GaussianDiffusion::new(&DiffusionConfig {
            num_timesteps: steps,
            beta_schedule: BetaSchedule::Cosine,
            mean_type,
            var_type: ModelVarType::FixedSmall,
        })
        .unwrap()
    }

    #[test]
    fn test_single_step_loop_shape_and_finite() {
        let diffusion = diffusion(1, ModelMeanType::StartX);
        let field = field(3, 8, Some(CorrMode::All));
        let cond = Conditioning::full(2, 8);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let x = diffusion
            .p_sample_loop(&Affine(0.5), &[2, 3, 1, 8], &cond, &field, &SampleOptions::default(), &mut rng)
            .unwrap();
        assert_eq!(x.dims(), &[2, 3, 1, 8]);
        let (_, _, finite) = summarize(&x).unwrap();
        assert!(finite);
    }

    #[test]
    fn test_loop_over_many_steps_is_finite() {
        let diffusion = diffusion(10, ModelMeanType::Epsilon);
        let field = field(2, 16, Some(CorrMode::All));
        let cond = Conditioning::from_lengths(&[16, 10], 16, &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let opts = SampleOptions {
            const_noise: true,
            clip_denoised: true,
            ..Default::default()
        };
        let x = diffusion
            .p_sample_loop(&Affine(0.1), &[2, 2, 1, 16], &cond, &field, &opts, &mut rng)
            .unwrap();
        let (_, std, finite) = summarize(&x).unwrap();
        assert!(finite && std.is_finite());
    }

    #[test]
    fn test_start_x_model_with_zero_output_collapses_to_zero() {
        // x̂_0 = 0 and no noise at t = 0: the posterior mean is exactly 0.
        let diffusion = diffusion(1, ModelMeanType::StartX);
        let field = field(1, 4, None);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let x = diffusion
            .p_sample_loop(
                &Affine(0.0),
                &[3, 1, 1, 4],
                &Conditioning::full(3, 4),
                &field,
                &SampleOptions::default(),
                &mut rng,
            )
            .unwrap();
        let total: f32 = x.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(total.abs() < 1e-6, "total = {total}");
    }

    #[test]
    fn test_shape_mismatch_is_an_error() {
        let diffusion = diffusion(4, ModelMeanType::StartX);
        let field = field(1, 8, None);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let err = diffusion
            .p_sample_loop(
                &Truncating,
                &[1, 1, 1, 8],
                &Conditioning::full(1, 8),
                &field,
                &SampleOptions::default(),
                &mut rng,
            )
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }), "{err}");

        // Requested shape does not match the field.
        assert!(
            diffusion
                .p_sample_loop(
                    &Affine(1.0),
                    &[1, 2, 1, 8],
                    &Conditioning::full(1, 8),
                    &field,
                    &SampleOptions::default(),
                    &mut rng,
                )
                .is_err()
        );
    }

    #[test]
    fn test_q_sample_extremes() {
        let diffusion = diffusion(10, ModelMeanType::StartX);
        let x0 = Tensor::ones((2, 1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let noise = Tensor::zeros((2, 1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let x_t = diffusion.q_sample(&x0, &[0, 9], &noise).unwrap();
        let rows: Vec<Vec<f32>> = x_t.reshape((2, 4)).unwrap().to_vec2().unwrap();
        let sqrt_ac = diffusion.schedule().sqrt_alphas_cumprod();
        assert!((rows[0][0] as f64 - sqrt_ac[0]).abs() < 1e-6);
        assert!((rows[1][3] as f64 - sqrt_ac[9]).abs() < 1e-6);
        assert!(rows[1][3] < rows[0][3]);
    }

    #[test]
    fn test_training_losses_for_perfect_start_x_model() {
        struct Oracle(Tensor);
        impl ScoreModel for Oracle {
            fn forward(
                &self,
                _x_t: &Tensor,
                _timesteps: &Tensor,
                _cond: &Conditioning,
                _field: &CorrelationField,
            ) -> Result<Tensor> {
                Ok(self.0.clone())
            }
        }

        let diffusion = diffusion(10, ModelMeanType::StartX);
        let field = field(2, 8, Some(CorrMode::All));
        let x0 = Tensor::randn(0f32, 1.0, (4, 2, 1, 8), &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let losses = diffusion
            .training_losses(&Oracle(x0.clone()), &x0, &[0, 3, 6, 9], &Conditioning::full(4, 8), &field, &mut rng)
            .unwrap();
        assert_eq!(losses.loss.dims(), &[4]);
        let total: f32 = losses.mse.sum_all().unwrap().to_scalar().unwrap();
        assert!(total.abs() < 1e-10);

        // Wrong timestep count.
        assert!(
            diffusion
                .training_losses(&Oracle(x0.clone()), &x0, &[0], &Conditioning::full(4, 8), &field, &mut rng)
                .is_err()
        );
    }

    #[test]
    fn test_masked_mse_ignores_padding() {
        let target = Tensor::zeros((2, 2, 1, 4), DType::F32, &Device::Cpu).unwrap();
        // Error 1 on the first two frames, 10 on the rest.
        let row = Tensor::new(&[1f32, 1.0, 10.0, 10.0], &Device::Cpu).unwrap();
        let pred = row.reshape((1, 1, 1, 4)).unwrap().broadcast_as((2, 2, 1, 4)).unwrap().contiguous().unwrap();
        let cond = Conditioning::from_lengths(&[2, 4], 4, &Device::Cpu).unwrap();
        let mse: Vec<f32> = masked_mse(&target, &pred, cond.mask.as_ref()).unwrap().to_vec1().unwrap();
        assert!((mse[0] - 1.0).abs() < 1e-6, "{mse:?}");
        assert!((mse[1] - 50.5).abs() < 1e-4, "{mse:?}");
        assert!(Conditioning::from_lengths(&[5], 4, &Device::Cpu).is_err());
    }
}
