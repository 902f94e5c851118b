//! Noise sources for the diffusion process.
//!
//! The diffusion code only asks a [`NoiseSource`] for a tensor of a given
//! shape, so correlated noise ([`CorrelationField`]) and i.i.d. noise
//! ([`WhiteNoise`]) are interchangeable in both the forward corruption step
//! and every reverse step.
//!
//! - [`assign`]: which kernel governs each feature dimension
//! - [`field`]: an assignment resolved against a [`KernelBank`](crate::kernel::KernelBank)

pub mod assign;
pub mod field;

use candle_core::{Device, Tensor};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::Result;

pub use assign::{
    CorrMode, CorrelationAssignment, DimCorrelation, KernelChoice, Override, assign_correlation,
};
pub use field::CorrelationField;

/// Anything that can stand in for `N(0, I)` noise of a requested shape.
pub trait NoiseSource {
    /// Draw a noise tensor of shape `dims` using `rng`.
    fn sample(&self, dims: &[usize], rng: &mut ChaCha8Rng) -> Result<Tensor>;
}

/// Independent standard-normal noise.
#[derive(Debug, Clone)]
pub struct WhiteNoise {
    device: Device,
}

impl WhiteNoise {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
        }
    }
}

impl NoiseSource for WhiteNoise {
    fn sample(&self, dims: &[usize], rng: &mut ChaCha8Rng) -> Result<Tensor> {
        standard_normal(dims, rng, &self.device)
    }
}

/// f32 tensor of i.i.d. `N(0, 1)` draws, reproducible from `rng`.
pub fn standard_normal(dims: &[usize], rng: &mut ChaCha8Rng, device: &Device) -> Result<Tensor> {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, dims, device)?)
}
