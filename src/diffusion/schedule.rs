//! Beta schedules and the per-timestep coefficients derived from them.
//!
//! ```text
//! ᾱ_t        = Π_{s≤t} (1 - β_s)
//! β̃_t        = β_t (1 - ᾱ_{t-1}) / (1 - ᾱ_t)            posterior variance
//! μ̃_t(x0,xt) = coef1_t · x0 + coef2_t · xt
//! coef1_t    = β_t sqrt(ᾱ_{t-1}) / (1 - ᾱ_t)
//! coef2_t    = (1 - ᾱ_{t-1}) sqrt(1 - β_t) / (1 - ᾱ_t)
//! ```

use std::f64::consts::FRAC_PI_2;

use crate::config::BetaSchedule;
use crate::{Error, Result};

const COSINE_OFFSET: f64 = 0.008;
const MAX_BETA: f64 = 0.999;

/// Linear schedule, scaled so any `num_timesteps` spans the same range as 1000.
/// Betas are capped at 0.999, which short schedules (`T ≤ 20`) reach.
pub fn linear_betas(num_timesteps: usize) -> Vec<f64> {
    let scale = 1000.0 / num_timesteps as f64;
    let start = (scale * 1e-4).min(MAX_BETA);
    let end = scale * 0.02;
    match num_timesteps {
        0 => Vec::new(),
        1 => vec![start],
        n => (0..n)
            .map(|i| (start + (end - start) * i as f64 / (n - 1) as f64).min(MAX_BETA))
            .collect(),
    }
}

/// Cosine schedule of Nichol & Dhariwal, `s = 0.008`, betas capped at 0.999.
pub fn cosine_betas(num_timesteps: usize) -> Vec<f64> {
    let alpha_bar = |t: f64| ((t + COSINE_OFFSET) / (1.0 + COSINE_OFFSET) * FRAC_PI_2).cos().powi(2);
    let n = num_timesteps as f64;
    (0..num_timesteps)
        .map(|i| {
            let t1 = i as f64 / n;
            let t2 = (i + 1) as f64 / n;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(MAX_BETA)
        })
        .collect()
}

/// All per-timestep constants of a discrete Gaussian diffusion.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    alphas_cumprod_prev: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
    large_variance: Vec<f64>,
    large_log_variance: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(kind: BetaSchedule, num_timesteps: usize) -> Result<Self> {
        let betas = match kind {
            BetaSchedule::Linear => linear_betas(num_timesteps),
            BetaSchedule::Cosine => cosine_betas(num_timesteps),
        };
        Self::from_betas(betas)
    }

    pub fn from_betas(betas: Vec<f64>) -> Result<Self> {
        if betas.is_empty() {
            return Err(Error::Config("diffusion needs at least one timestep".into()));
        }
        // β = 1 empties ᾱ and makes the x0 reconstruction coefficients infinite.
        if let Some(bad) = betas.iter().find(|b| !(**b > 0.0 && **b < 1.0)) {
            return Err(Error::Config(format!("beta {bad} outside (0, 1)")));
        }

        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut acc = 1.0;
        for b in &betas {
            acc *= 1.0 - b;
            alphas_cumprod.push(acc);
        }
        let alphas_cumprod_prev: Vec<f64> = std::iter::once(1.0)
            .chain(alphas_cumprod[..betas.len() - 1].iter().copied())
            .collect();

        let map = |f: &dyn Fn(usize) -> f64| (0..betas.len()).map(f).collect::<Vec<f64>>();

        let posterior_variance =
            map(&|t| betas[t] * (1.0 - alphas_cumprod_prev[t]) / (1.0 - alphas_cumprod[t]));
        // The first posterior variance is 0; borrow the next one before taking the log.
        let first = posterior_variance.get(1).copied().unwrap_or(betas[0]);
        let posterior_log_variance_clipped =
            map(&|t| if t == 0 { first.ln() } else { posterior_variance[t].ln() });
        let large_variance = map(&|t| if t == 0 { first } else { betas[t] });
        let large_log_variance = large_variance.iter().map(|v| v.ln()).collect();

        Ok(Self {
            sqrt_alphas_cumprod: map(&|t| alphas_cumprod[t].sqrt()),
            sqrt_one_minus_alphas_cumprod: map(&|t| (1.0 - alphas_cumprod[t]).sqrt()),
            sqrt_recip_alphas_cumprod: map(&|t| (1.0 / alphas_cumprod[t]).sqrt()),
            sqrt_recipm1_alphas_cumprod: map(&|t| (1.0 / alphas_cumprod[t] - 1.0).sqrt()),
            posterior_mean_coef1: map(&|t| {
                betas[t] * alphas_cumprod_prev[t].sqrt() / (1.0 - alphas_cumprod[t])
            }),
            posterior_mean_coef2: map(&|t| {
                (1.0 - alphas_cumprod_prev[t]) * (1.0 - betas[t]).sqrt() / (1.0 - alphas_cumprod[t])
            }),
            posterior_variance,
            posterior_log_variance_clipped,
            large_variance,
            large_log_variance,
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn alphas_cumprod_prev(&self) -> &[f64] {
        &self.alphas_cumprod_prev
    }

    pub fn sqrt_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_alphas_cumprod
    }

    pub fn sqrt_one_minus_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_one_minus_alphas_cumprod
    }

    pub fn sqrt_recip_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_recip_alphas_cumprod
    }

    pub fn sqrt_recipm1_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_recipm1_alphas_cumprod
    }

    pub fn posterior_variance(&self) -> &[f64] {
        &self.posterior_variance
    }

    pub fn posterior_log_variance_clipped(&self) -> &[f64] {
        &self.posterior_log_variance_clipped
    }

    pub fn posterior_mean_coef1(&self) -> &[f64] {
        &self.posterior_mean_coef1
    }

    pub fn posterior_mean_coef2(&self) -> &[f64] {
        &self.posterior_mean_coef2
    }

    /// `β_t` with the first entry replaced by `β̃_1`.
    pub fn large_variance(&self) -> &[f64] {
        &self.large_variance
    }

    pub fn large_log_variance(&self) -> &[f64] {
        &self.large_log_variance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_endpoints() {
        let betas = linear_betas(1000);
        assert_eq!(betas.len(), 1000);
        assert!((betas[0] - 1e-4).abs() < 1e-12);
        assert!((betas[999] - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_alphas_cumprod_decreasing() {
        for kind in [BetaSchedule::Linear, BetaSchedule::Cosine] {
            let s = NoiseSchedule::new(kind, 1000).unwrap();
            let ac = s.alphas_cumprod();
            assert!(ac.windows(2).all(|w| w[1] < w[0]), "{kind:?}");
            assert!(ac[0] < 1.0 && ac[999] > 0.0);
            assert!(s.posterior_log_variance_clipped().iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_cosine_is_capped() {
        let betas = cosine_betas(10);
        assert!(betas.iter().all(|&b| b > 0.0 && b <= MAX_BETA));
        assert!((betas[9] - MAX_BETA).abs() < 1e-12);
    }

    #[test]
    fn test_posterior_coefficients_at_first_step() {
        let s = NoiseSchedule::new(BetaSchedule::Cosine, 50).unwrap();
        // ᾱ_{-1} = 1: the posterior mean is x0 and its variance is 0.
        assert!((s.posterior_mean_coef1()[0] - 1.0).abs() < 1e-9);
        assert!(s.posterior_mean_coef2()[0].abs() < 1e-12);
        assert_eq!(s.posterior_variance()[0], 0.0);
        assert!(
            (s.posterior_log_variance_clipped()[0] - s.posterior_variance()[1].ln()).abs() < 1e-12
        );
    }

    #[test]
    fn test_single_step_schedule() {
        let s = NoiseSchedule::new(BetaSchedule::Cosine, 1).unwrap();
        assert_eq!(s.num_timesteps(), 1);
        assert!(s.posterior_log_variance_clipped()[0].is_finite());
        assert!(s.large_log_variance()[0].is_finite());
    }

    #[test]
    fn test_rejects_invalid_betas() {
        assert!(NoiseSchedule::from_betas(vec![]).is_err());
        assert!(NoiseSchedule::from_betas(vec![0.1, 1.5]).is_err());
        assert!(NoiseSchedule::from_betas(vec![0.0, 0.1]).is_err());
        assert!(NoiseSchedule::from_betas(vec![0.1, 1.0]).is_err());
    }

    #[test]
    fn test_short_schedules_have_finite_coefficients() {
        for kind in [BetaSchedule::Linear, BetaSchedule::Cosine] {
            for steps in [1, 2, 5, 10, 20, 50] {
                let s = NoiseSchedule::new(kind, steps).unwrap();
                let tables: [&[f64]; 12] = [
                    s.betas(),
                    s.alphas_cumprod(),
                    s.sqrt_alphas_cumprod(),
                    s.sqrt_one_minus_alphas_cumprod(),
                    s.sqrt_recip_alphas_cumprod(),
                    s.sqrt_recipm1_alphas_cumprod(),
                    s.posterior_variance(),
                    s.posterior_log_variance_clipped(),
                    s.posterior_mean_coef1(),
                    s.posterior_mean_coef2(),
                    s.large_variance(),
                    s.large_log_variance(),
                ];
                for table in tables {
                    assert!(table.iter().all(|v| v.is_finite()), "{kind:?} T={steps}: {table:?}");
                }
                assert!(s.alphas_cumprod()[steps - 1] > 0.0);
            }
        }
        // T = 20 reaches the cap exactly at the last step.
        assert_eq!(*linear_betas(20).last().unwrap(), MAX_BETA);
    }
}
