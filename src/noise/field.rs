//! Correlation field: an assignment resolved against a kernel bank.
//!
//! For dimension `d` with task factor `F_d`, template factor `T_d` and
//! strength `w_d` the noise is
//!
//! ```text
//! ε_d = sqrt(1 - w_d) · T_d z₁ + sqrt(w_d) · F_d z₂,   z₁, z₂ ~ N(0, I)
//! Cov(ε_d) = (1 - w_d) · K_template + w_d · K_task
//! ```
//!
//! When every dimension sits purely on one side (all template, or all task at
//! full strength) only one batched matmul is done.

use candle_core::{Device, Tensor};
use rand_chacha::ChaCha8Rng;

use super::assign::{CorrelationAssignment, KernelChoice};
use super::{NoiseSource, standard_normal};
use crate::kernel::KernelBank;
use crate::{Error, Result};

/// Per-dimension correlated noise generator for one sampling/training session.
#[derive(Debug, Clone)]
pub struct CorrelationField {
    dims: usize,
    frames: usize,
    choices: Vec<KernelChoice>,
    template: Option<Tensor>,   // [dims, L, L]
    task: Option<Tensor>,       // [dims, L, L]
    template_scale: Tensor,     // [dims, 1, 1]
    task_scale: Tensor,         // [dims, 1, 1]
    lengths: Tensor,            // [dims]
    device: Device,
}

impl CorrelationField {
    pub fn new(
        bank: &KernelBank,
        assignment: &CorrelationAssignment,
        device: &Device,
    ) -> Result<Self> {
        let dims = assignment.len();
        if dims != bank.dims() {
            return Err(Error::Config(format!(
                "assignment covers {dims} dimensions, kernel bank has {}",
                bank.dims()
            )));
        }

        let mut indices = Vec::with_capacity(dims);
        let mut weights = Vec::with_capacity(dims);
        for entry in assignment.iter() {
            match entry.kernel {
                KernelChoice::Template => {
                    indices.push(0u32);
                    weights.push(0.0f64);
                }
                KernelChoice::LengthScale(index) => {
                    bank.length_scale(index)?;
                    indices.push(index as u32);
                    weights.push(entry.strength.clamp(0.0, 1.0));
                }
            }
        }

        let all_template = weights.iter().all(|&w| w == 0.0);
        let all_task = weights.iter().all(|&w| w == 1.0);

        let template = if all_task {
            None
        } else {
            Some(bank.template().to_device(device)?)
        };
        let task = if all_template {
            None
        } else {
            let idx = Tensor::new(indices.as_slice(), device)?;
            Some(bank.factors().to_device(device)?.index_select(&idx, 0)?)
        };

        let template_scale: Vec<f32> = weights.iter().map(|w| (1.0 - w).sqrt() as f32).collect();
        let task_scale: Vec<f32> = weights.iter().map(|w| w.sqrt() as f32).collect();
        let lengths: Vec<f32> = assignment.iter().map(|d| d.length as f32).collect();

        Ok(Self {
            dims,
            frames: bank.num_frames(),
            choices: assignment.iter().map(|d| d.kernel).collect(),
            template,
            task,
            template_scale: Tensor::from_vec(template_scale, (dims, 1, 1), device)?,
            task_scale: Tensor::from_vec(task_scale, (dims, 1, 1), device)?,
            lengths: Tensor::from_vec(lengths, dims, device)?,
            device: device.clone(),
        })
    }

    /// Correlated noise `[batch, dims, L]`.
    pub fn sample_noise(&self, batch: usize, rng: &mut ChaCha8Rng) -> Result<Tensor> {
        let shape = [self.dims, self.frames, batch];
        let noise = match (&self.template, &self.task) {
            (Some(template), None) => {
                template.matmul(&standard_normal(&shape, rng, &self.device)?)?
            }
            (None, Some(task)) => task.matmul(&standard_normal(&shape, rng, &self.device)?)?,
            (Some(template), Some(task)) => {
                let white = template
                    .matmul(&standard_normal(&shape, rng, &self.device)?)?
                    .broadcast_mul(&self.template_scale)?;
                let correlated = task
                    .matmul(&standard_normal(&shape, rng, &self.device)?)?
                    .broadcast_mul(&self.task_scale)?;
                (white + correlated)?
            }
            (None, None) => {
                return Err(Error::Config("correlation field has no dimensions".into()));
            }
        };
        // [dims, L, batch] -> [batch, dims, L]
        Ok(noise.permute((2, 0, 1))?.contiguous()?)
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Kernel choice of every dimension.
    pub fn choices(&self) -> &[KernelChoice] {
        &self.choices
    }

    /// Template factors `[dims, L, L]`, absent when no dimension uses them.
    pub fn template_factors(&self) -> Option<&Tensor> {
        self.template.as_ref()
    }

    /// Task factors `[dims, L, L]`, absent when every dimension is on the template.
    pub fn task_factors(&self) -> Option<&Tensor> {
        self.task.as_ref()
    }

    /// Per-dimension length conditioning `[dims]`.
    pub fn lengths(&self) -> &Tensor {
        &self.lengths
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl NoiseSource for CorrelationField {
    /// Accepts `[batch, ..., L]` where the middle dimensions flatten to `dims`.
    fn sample(&self, dims: &[usize], rng: &mut ChaCha8Rng) -> Result<Tensor> {
        let (batch, frames, features) = match dims {
            [batch, middle @ .., frames] if !middle.is_empty() => {
                (*batch, *frames, middle.iter().product::<usize>())
            }
            _ => {
                return Err(Error::ShapeMismatch {
                    expected: vec![0, self.dims, self.frames],
                    actual: dims.to_vec(),
                });
            }
        };
        if features != self.dims || frames != self.frames {
            return Err(Error::ShapeMismatch {
                expected: vec![batch, self.dims, self.frames],
                actual: dims.to_vec(),
            });
        }
        Ok(self.sample_noise(batch, rng)?.reshape(dims)?)
    }
}
