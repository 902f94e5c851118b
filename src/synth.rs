//! Synthetic 1-D trajectories for toy diffusion experiments.
//!
//! Every generator works on `TimeGrid::unit(L)` and returns `[n_traj, L]`:
//!
//! ```text
//! step      square wave, period ~ U(0.38, 0.42), high for the first half period
//! step2     piecewise constant, segment length ~ L·Exp(5), at least ceil(0.1·L)
//! gp        GP draws, gain 2.0, length-scale 0.2
//! gp2       GP draws, length-scale picked per trajectory from a fixed set
//! triangle  sawtooth, period 0.2
//! ```
//!
//! With `split > 0` each trajectory is also cut into `split` equal blocks,
//! stacked block-major, with the block index as a per-row label.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::Exp1;

use crate::kernel::{Factorization, TimeGrid, build_kernel, factorize};
use crate::{Error, Result};

/// Length-scales `gp2` chooses from.
pub const GP2_LENGTH_SCALES: [f64; 7] = [0.001, 0.1, 0.2, 0.4, 0.6, 0.8, 1.0];

const GP_GAIN: f64 = 2.0;
const GP_LENGTH_SCALE: f64 = 0.2;
const GP_MEAS_STD: f64 = 1e-8;
const STEP2_RATE: f64 = 5.0;
const STEP2_MIN_DURATION: f64 = 0.1;
const TRIANGLE_PERIOD: f64 = 0.2;

/// Kind of synthetic trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrajType {
    Step,
    Step2,
    Gp,
    Gp2,
    Triangle,
}

/// Rows plus, for `gp2`, the length-scale each row was drawn with.
struct Generated {
    rows: Vec<Vec<f64>>,
    length_scales: Option<Vec<f64>>,
}

type Generator = fn(&TimeGrid, usize, &mut ChaCha8Rng) -> Result<Generated>;

const TRAJ_TYPES: &[(&str, TrajType, Generator)] = &[
    ("step", TrajType::Step, gen_step),
    ("step2", TrajType::Step2, gen_step2),
    ("gp", TrajType::Gp, gen_gp),
    ("gp2", TrajType::Gp2, gen_gp2),
    ("triangle", TrajType::Triangle, gen_triangle),
];

impl TrajType {
    pub fn name(self) -> &'static str {
        self.entry().0
    }

    // Table rows are in declaration order.
    fn entry(self) -> &'static (&'static str, TrajType, Generator) {
        &TRAJ_TYPES[self as usize]
    }
}

impl FromStr for TrajType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TRAJ_TYPES
            .iter()
            .find(|(name, _, _)| *name == s)
            .map(|(_, ty, _)| *ty)
            .ok_or_else(|| Error::UnknownTrajType(s.to_string()))
    }
}

impl fmt::Display for TrajType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Trajectories cut into equal blocks.
#[derive(Debug, Clone)]
pub struct SplitTrajectories {
    /// `[split * n_traj, L / split]`, block-major.
    pub trajectories: Tensor,
    /// `[split * n_traj, L / split]`, u32 block index.
    pub labels: Tensor,
}

/// Output of [`generate`].
#[derive(Debug, Clone)]
pub struct TrajectoryBatch {
    pub times: TimeGrid,
    /// `[n_traj, L]`, f32.
    pub trajectories: Tensor,
    /// `[n_traj, 1]`, only for `gp2`.
    pub length_scales: Option<Tensor>,
    pub split: Option<SplitTrajectories>,
}

impl TrajectoryBatch {
    /// Trajectories as single-channel motion `[n_traj, 1, L]`.
    pub fn x0(&self) -> Result<Tensor> {
        Ok(self.trajectories.unsqueeze(1)?)
    }

    pub fn len(&self) -> usize {
        self.trajectories.dim(0).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Generate `n_traj` trajectories of length `len`.
///
/// `seed: None` draws a fresh seed from the thread RNG; the seed actually used
/// is logged so a run can be repeated.
pub fn generate(
    traj_type: TrajType,
    n_traj: usize,
    len: usize,
    seed: Option<u64>,
    split: usize,
    device: &Device,
) -> Result<TrajectoryBatch> {
    if len == 0 {
        return Err(Error::Config("trajectory length must be positive".into()));
    }
    if split > 0 && len % split != 0 {
        return Err(Error::Config(format!(
            "trajectory length {len} is not divisible by split {split}"
        )));
    }

    let seed = seed.unwrap_or_else(rand::random);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let times = TimeGrid::unit(len)?;
    let generated = (traj_type.entry().2)(&times, n_traj, &mut rng)?;
    tracing::debug!(traj_type = %traj_type, n_traj, len, seed, split, "generated trajectories");

    let flat: Vec<f32> = generated.rows.iter().flatten().map(|&v| v as f32).collect();
    let trajectories = Tensor::from_vec(flat, (n_traj, len), device)?;
    let length_scales = match generated.length_scales {
        Some(ls) => {
            let ls: Vec<f32> = ls.into_iter().map(|v| v as f32).collect();
            Some(Tensor::from_vec(ls, (n_traj, 1), device)?)
        }
        None => None,
    };
    let split = if split > 0 {
        Some(split_blocks(&trajectories, split)?)
    } else {
        None
    };

    Ok(TrajectoryBatch {
        times,
        trajectories,
        length_scales,
        split,
    })
}

fn split_blocks(trajectories: &Tensor, split: usize) -> Result<SplitTrajectories> {
    let (n, len) = trajectories.dims2()?;
    let block = len / split;
    let chunks = trajectories.chunk(split, 1)?;
    let trajectories = Tensor::cat(&chunks, 0)?.contiguous()?;

    let labels: Vec<u32> = (0..split as u32)
        .flat_map(|b| std::iter::repeat_n(b, n * block))
        .collect();
    let labels = Tensor::from_vec(labels, (split * n, block), trajectories.device())?;
    Ok(SplitTrajectories {
        trajectories,
        labels,
    })
}

fn gen_step(times: &TimeGrid, n: usize, rng: &mut ChaCha8Rng) -> Result<Generated> {
    let rows = (0..n)
        .map(|_| {
            let period = rng.random_range(0.38..0.42);
            let offset = rng.random_range(-0.02..0.02);
            let low = rng.random_range(-3.2..-2.8);
            let high = rng.random_range(2.8..3.2);
            times
                .as_slice()
                .iter()
                .map(|&t| {
                    let phase = ((t + offset) / period).rem_euclid(1.0);
                    if phase < 0.5 { high } else { low }
                })
                .collect()
        })
        .collect();
    Ok(Generated {
        rows,
        length_scales: None,
    })
}

fn gen_step2(times: &TimeGrid, n: usize, rng: &mut ChaCha8Rng) -> Result<Generated> {
    let len = times.len();
    let min_ticks = (STEP2_MIN_DURATION * len as f64).ceil() as usize;
    let duration = |rng: &mut ChaCha8Rng| {
        let e: f64 = rng.sample(Exp1);
        ((len as f64 * e / STEP2_RATE).floor() as usize).max(min_ticks).max(1)
    };

    let rows = (0..n)
        .map(|_| {
            let mut row = vec![0.0f64; len];
            let mut from = 0;
            while from < len {
                let value = rng.random_range(-3.0..3.0);
                let to = (from + duration(rng)).min(len);
                row[from..to].fill(value);
                from = to;
            }
            row
        })
        .collect();
    Ok(Generated {
        rows,
        length_scales: None,
    })
}

fn gp_factor(times: &TimeGrid, length_scale: f64) -> Result<Factorization> {
    let kernel = build_kernel(times.as_slice(), GP_GAIN, length_scale, GP_MEAS_STD * GP_MEAS_STD)?;
    Ok(factorize(&kernel))
}

fn gen_gp(times: &TimeGrid, n: usize, rng: &mut ChaCha8Rng) -> Result<Generated> {
    let factor = gp_factor(times, GP_LENGTH_SCALE)?;
    let rows = (0..n).map(|_| factor.draw(rng).iter().copied().collect()).collect();
    Ok(Generated {
        rows,
        length_scales: None,
    })
}

fn gen_gp2(times: &TimeGrid, n: usize, rng: &mut ChaCha8Rng) -> Result<Generated> {
    let factors = GP2_LENGTH_SCALES
        .iter()
        .map(|&ls| gp_factor(times, ls))
        .collect::<Result<Vec<_>>>()?;

    let mut rows = Vec::with_capacity(n);
    let mut length_scales = Vec::with_capacity(n);
    for _ in 0..n {
        let idx = rng.random_range(0..GP2_LENGTH_SCALES.len());
        rows.push(factors[idx].draw(rng).iter().copied().collect());
        length_scales.push(GP2_LENGTH_SCALES[idx]);
    }
    Ok(Generated {
        rows,
        length_scales: Some(length_scales),
    })
}

fn gen_triangle(times: &TimeGrid, n: usize, rng: &mut ChaCha8Rng) -> Result<Generated> {
    let rows = (0..n)
        .map(|_| {
            let offset = rng.random_range(-0.02..0.02);
            let low = rng.random_range(-3.2..-2.8);
            let high = rng.random_range(2.8..3.2);
            times
                .as_slice()
                .iter()
                .map(|&t| {
                    let phase = (t + offset).rem_euclid(TRIANGLE_PERIOD) / TRIANGLE_PERIOD;
                    (high - low) * phase + low
                })
                .collect()
        })
        .collect();
    Ok(Generated {
        rows,
        length_scales: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(batch: &TrajectoryBatch) -> Vec<Vec<f32>> {
        batch.trajectories.to_vec2().unwrap()
    }

    #[test]
    fn test_lookup_by_name() {
        for name in ["step", "step2", "gp", "gp2", "triangle"] {
            let ty: TrajType = name.parse().unwrap();
            assert_eq!(ty.name(), name);
            assert_eq!(ty.entry().1, ty);
        }
        assert!(matches!(
            "sine".parse::<TrajType>(),
            Err(Error::UnknownTrajType(name)) if name == "sine"
        ));
    }

    #[test]
    fn test_step_values_in_range() {
        let batch = generate(TrajType::Step, 50, 100, Some(1), 0, &Device::Cpu).unwrap();
        assert_eq!(batch.trajectories.dims(), &[50, 100]);
        for row in rows(&batch) {
            assert!(row.iter().all(|v| (-3.2..=3.2).contains(v)), "{row:?}");
            assert!(row.iter().any(|&v| v > 0.0) && row.iter().any(|&v| v < 0.0));
        }
    }

    #[test]
    fn test_step2_minimum_run_length() {
        let len = 97;
        let min_ticks = (0.1 * len as f64).ceil() as usize;
        let batch = generate(TrajType::Step2, 40, len, Some(2), 0, &Device::Cpu).unwrap();
        for row in rows(&batch) {
            let mut runs = Vec::new();
            let mut run = 1;
            for w in row.windows(2) {
                if w[1] == w[0] {
                    run += 1;
                } else {
                    runs.push(run);
                    run = 1;
                }
            }
            // The last run may be truncated by the end of the trajectory.
            assert!(runs.iter().all(|&r| r >= min_ticks), "runs {runs:?}");
            assert!(row.iter().all(|v| (-3.0..=3.0).contains(v)));
        }
    }

    #[test]
    fn test_gp2_reports_length_scales() {
        let batch = generate(TrajType::Gp2, 20, 32, Some(3), 0, &Device::Cpu).unwrap();
        let ls = batch.length_scales.as_ref().unwrap();
        assert_eq!(ls.dims(), &[20, 1]);
        let ls: Vec<f32> = ls.flatten_all().unwrap().to_vec1().unwrap();
        assert!(
            ls.iter()
                .all(|&v| GP2_LENGTH_SCALES.iter().any(|&c| (c as f32 - v).abs() < 1e-7))
        );
        assert!(generate(TrajType::Gp, 2, 32, Some(3), 0, &Device::Cpu)
            .unwrap()
            .length_scales
            .is_none());
    }

    #[test]
    fn test_triangle_is_a_rising_sawtooth() {
        let batch = generate(TrajType::Triangle, 5, 200, Some(4), 0, &Device::Cpu).unwrap();
        for row in rows(&batch) {
            let drops = row.windows(2).filter(|w| w[1] < w[0]).count();
            // Period 0.2 over [0, 1]: about five resets.
            assert!((4..=6).contains(&drops), "drops = {drops}");
        }
    }

    #[test]
    fn test_seed_reproducibility() {
        let a = generate(TrajType::Gp, 3, 16, Some(9), 0, &Device::Cpu).unwrap();
        let b = generate(TrajType::Gp, 3, 16, Some(9), 0, &Device::Cpu).unwrap();
        assert_eq!(rows(&a), rows(&b));
        let c = generate(TrajType::Gp, 3, 16, None, 0, &Device::Cpu).unwrap();
        assert_eq!(c.trajectories.dims(), &[3, 16]);
    }

    #[test]
    fn test_split_is_block_major() {
        let batch = generate(TrajType::Step2, 2, 12, Some(5), 3, &Device::Cpu).unwrap();
        let split = batch.split.as_ref().unwrap();
        assert_eq!(split.trajectories.dims(), &[6, 4]);
        assert_eq!(split.labels.dims(), &[6, 4]);

        let full = rows(&batch);
        let parts: Vec<Vec<f32>> = split.trajectories.to_vec2().unwrap();
        // Row 3 is block 1 of trajectory 1.
        assert_eq!(parts[3], full[1][4..8].to_vec());
        let labels: Vec<Vec<u32>> = split.labels.to_vec2().unwrap();
        assert_eq!(labels[3], vec![1, 1, 1, 1]);
        assert_eq!(labels[5], vec![2, 2, 2, 2]);

        assert!(generate(TrajType::Step, 2, 10, Some(5), 3, &Device::Cpu).is_err());
    }

    #[test]
    fn test_x0_adds_channel_axis() {
        let batch = generate(TrajType::Step, 4, 8, Some(6), 0, &Device::Cpu).unwrap();
        assert_eq!(batch.x0().unwrap().dims(), &[4, 1, 8]);
        assert_eq!(batch.len(), 4);
    }
}
