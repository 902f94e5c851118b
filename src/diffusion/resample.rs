//! Timestep samplers for training.
//!
//! A sampler proposes a distribution `p(t)` over diffusion steps; each drawn
//! step comes with the importance weight `1 / (T · p(t))` so the weighted loss
//! stays an unbiased estimate of the uniform objective.

use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand_chacha::ChaCha8Rng;

use crate::config::TimestepSampling;
use crate::{Error, Result};

/// Losses kept per timestep before the second moment is trusted.
pub const HISTORY_PER_TERM: usize = 10;
/// Probability mass always spread uniformly over all timesteps.
pub const UNIFORM_PROB: f64 = 1e-3;

pub trait ScheduleSampler {
    /// Unnormalised sampling weights, one per timestep.
    fn weights(&self) -> Vec<f64>;

    /// Feed back the per-sample losses of a training step.
    fn update_with_losses(&mut self, _timesteps: &[usize], _losses: &[f64]) {}

    /// Draw `batch` timesteps and their importance weights.
    fn sample(&self, batch: usize, rng: &mut ChaCha8Rng) -> Result<(Vec<usize>, Vec<f32>)> {
        let w = self.weights();
        let total: f64 = w.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(Error::Config(format!("invalid timestep weights (sum {total})")));
        }
        let dist = WeightedIndex::new(&w)
            .map_err(|e| Error::Config(format!("invalid timestep weights: {e}")))?;
        let n = w.len() as f64;
        let mut timesteps = Vec::with_capacity(batch);
        let mut weights = Vec::with_capacity(batch);
        for _ in 0..batch {
            let t = dist.sample(rng);
            timesteps.push(t);
            weights.push((total / (n * w[t])) as f32);
        }
        Ok((timesteps, weights))
    }
}

/// `p(t) = 1 / T`.
#[derive(Debug, Clone)]
pub struct UniformSampler {
    num_timesteps: usize,
}

impl UniformSampler {
    pub fn new(num_timesteps: usize) -> Self {
        Self { num_timesteps }
    }
}

impl ScheduleSampler for UniformSampler {
    fn weights(&self) -> Vec<f64> {
        vec![1.0; self.num_timesteps]
    }
}

/// Importance sampling by `sqrt(E[loss²])` per timestep, once every timestep
/// has a full loss history. Uniform until then.
#[derive(Debug, Clone)]
pub struct LossSecondMomentResampler {
    history: Vec<[f64; HISTORY_PER_TERM]>,
    counts: Vec<usize>,
}

impl LossSecondMomentResampler {
    pub fn new(num_timesteps: usize) -> Self {
        Self {
            history: vec![[0.0; HISTORY_PER_TERM]; num_timesteps],
            counts: vec![0; num_timesteps],
        }
    }

    pub fn warmed_up(&self) -> bool {
        self.counts.iter().all(|&c| c == HISTORY_PER_TERM)
    }
}

impl ScheduleSampler for LossSecondMomentResampler {
    fn weights(&self) -> Vec<f64> {
        let n = self.history.len();
        if !self.warmed_up() {
            return vec![1.0; n];
        }
        let raw: Vec<f64> = self
            .history
            .iter()
            .map(|h| (h.iter().map(|l| l * l).sum::<f64>() / HISTORY_PER_TERM as f64).sqrt())
            .collect();
        let sum: f64 = raw.iter().sum();
        if !(sum.is_finite() && sum > 0.0) {
            return vec![1.0; n];
        }
        raw.iter()
            .map(|w| w / sum * (1.0 - UNIFORM_PROB) + UNIFORM_PROB / n as f64)
            .collect()
    }

    fn update_with_losses(&mut self, timesteps: &[usize], losses: &[f64]) {
        for (&t, &loss) in timesteps.iter().zip(losses) {
            let Some(history) = self.history.get_mut(t) else {
                continue;
            };
            let count = &mut self.counts[t];
            if *count == HISTORY_PER_TERM {
                history.rotate_left(1);
                history[HISTORY_PER_TERM - 1] = loss;
            } else {
                history[*count] = loss;
                *count += 1;
            }
        }
    }
}

/// Sampler for a configured strategy.
pub fn create_sampler(kind: TimestepSampling, num_timesteps: usize) -> Box<dyn ScheduleSampler> {
    match kind {
        TimestepSampling::Uniform => Box::new(UniformSampler::new(num_timesteps)),
        TimestepSampling::LossSecondMoment => {
            Box::new(LossSecondMomentResampler::new(num_timesteps))
        }
    }
}
