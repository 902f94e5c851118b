//! Squared-exponential Gaussian-process kernels and their square-root factors.
//!
//! ```text
//! K[i,j] = gain * exp(-(t_i - t_j)^2 / length_scale^2) + jitter * δ_ij
//! K      = V diag(U) V^T          (symmetric eigendecomposition)
//! F      = V diag(sqrt(max(U, 0)))
//! ```
//!
//! Left-multiplying white noise by `F` gives noise with covariance `F F^T ≈ K`.
//! Negative eigenvalues (numerical noise on very smooth kernels) are clamped to
//! zero instead of being reported.

pub mod bank;

use candle_core::{Device, Tensor};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{Error, Result};

pub use bank::KernelBank;

/// Default diagonal jitter.
pub const DEFAULT_JITTER: f64 = 1e-6;

/// Ordered, finite timestamps shared by every kernel of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeGrid {
    times: Vec<f64>,
}

impl TimeGrid {
    /// Validate raw timestamps: non-empty, finite and strictly increasing.
    pub fn new(times: Vec<f64>) -> Result<Self> {
        if times.is_empty() {
            return Err(Error::Kernel("time grid is empty".into()));
        }
        if let Some(bad) = times.iter().find(|t| !t.is_finite()) {
            return Err(Error::Kernel(format!("non-finite timestamp {bad}")));
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(Error::Kernel("timestamps must be strictly increasing".into()));
        }
        Ok(Self { times })
    }

    /// `len` evenly spaced points on `[0, 1]`.
    pub fn unit(len: usize) -> Result<Self> {
        Self::new(linspace(0.0, 1.0, len))
    }

    /// `len` frames at `fps`, spread over `[0, len / fps]`.
    pub fn frames(len: usize, fps: f64) -> Result<Self> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(Error::Kernel(format!("fps must be positive, got {fps}")));
        }
        Self::new(linspace(0.0, len as f64 / fps, len))
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.times
    }
}

fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..num)
            .map(|i| start + (stop - start) * i as f64 / (num - 1) as f64)
            .collect(),
    }
}

/// A jittered squared-exponential covariance matrix.
#[derive(Debug, Clone)]
pub struct Kernel {
    matrix: DMatrix<f64>,
    gain: f64,
    length_scale: f64,
}

impl Kernel {
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn length_scale(&self) -> f64 {
        self.length_scale
    }

    pub fn len(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.nrows() == 0
    }
}

/// Build the squared-exponential kernel over `times`.
pub fn build_kernel(times: &[f64], gain: f64, length_scale: f64, jitter: f64) -> Result<Kernel> {
    if let Some(bad) = times.iter().find(|t| !t.is_finite()) {
        return Err(Error::Kernel(format!("non-finite timestamp {bad}")));
    }
    if !(length_scale.is_finite() && length_scale > 0.0) {
        return Err(Error::Kernel(format!(
            "length-scale must be positive and finite, got {length_scale}"
        )));
    }
    if !gain.is_finite() {
        return Err(Error::Kernel(format!("gain must be finite, got {gain}")));
    }
    if !(jitter.is_finite() && jitter >= 0.0) {
        return Err(Error::Kernel(format!("jitter must be non-negative, got {jitter}")));
    }

    let n = times.len();
    let matrix = DMatrix::from_fn(n, n, |i, j| {
        let d = (times[i] - times[j]) / length_scale;
        let k = gain * (-d * d).exp();
        if i == j { k + jitter } else { k }
    });

    Ok(Kernel {
        matrix,
        gain,
        length_scale,
    })
}

/// Square-root factor `F` of a kernel, `F F^T ≈ K`.
#[derive(Debug, Clone)]
pub struct Factorization {
    factor: DMatrix<f64>,
}

/// Factorize a kernel via symmetric eigendecomposition.
pub fn factorize(kernel: &Kernel) -> Factorization {
    let eigen = SymmetricEigen::new(kernel.matrix.clone());
    let roots = eigen.eigenvalues.map(|u| u.max(0.0).sqrt());
    let factor = eigen.eigenvectors * DMatrix::from_diagonal(&roots);
    Factorization { factor }
}

impl Factorization {
    pub fn factor(&self) -> &DMatrix<f64> {
        &self.factor
    }

    pub fn len(&self) -> usize {
        self.factor.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.factor.nrows() == 0
    }

    /// `F F^T`.
    pub fn reconstruct(&self) -> DMatrix<f64> {
        &self.factor * self.factor.transpose()
    }

    /// Draw one correlated sample `F z`, `z ~ N(0, I)`.
    pub fn draw<R: Rng>(&self, rng: &mut R) -> DVector<f64> {
        let z = DVector::from_fn(self.len(), |_, _| rng.sample::<f64, _>(StandardNormal));
        &self.factor * z
    }

    /// Row-major f32 tensor `[L, L]`.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let n = self.len();
        let data: Vec<f32> = (0..n)
            .flat_map(|i| (0..n).map(move |j| (i, j)))
            .map(|(i, j)| self.factor[(i, j)] as f32)
            .collect();
        Ok(Tensor::from_vec(data, (n, n), device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn max_abs_diff(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
        (a - b).iter().fold(0.0f64, |m, x| m.max(x.abs()))
    }

    #[test]
    fn test_kernel_entries() {
        let grid = TimeGrid::unit(5).unwrap();
        let k = build_kernel(grid.as_slice(), 2.0, 0.5, 0.0).unwrap();
        // t = 0.0 and 0.25: 2 * exp(-(0.25/0.5)^2) = 2 * exp(-0.25)
        assert!((k.matrix()[(0, 1)] - 2.0 * (-0.25f64).exp()).abs() < 1e-12);
        assert!((k.matrix()[(3, 3)] - 2.0).abs() < 1e-12);
        assert_eq!(k.matrix()[(1, 4)], k.matrix()[(4, 1)]);
    }

    #[test]
    fn test_factor_reconstructs_kernel() {
        let grid = TimeGrid::frames(60, 20.0).unwrap();
        for &(gain, len) in &[(0.1, 0.033), (0.1, 0.35533333), (1.0, 1.0), (2.0, 0.2)] {
            let k = build_kernel(grid.as_slice(), gain, len, DEFAULT_JITTER).unwrap();
            let f = factorize(&k);
            assert_eq!(f.factor().shape(), (60, 60));
            let err = max_abs_diff(&f.reconstruct(), k.matrix());
            assert!(err < 1e-9, "gain={gain} len={len}: max error {err}");
        }
    }

    #[test]
    fn test_smooth_kernel_without_jitter_is_clamped_not_rejected() {
        // Numerically rank-deficient: some eigenvalues come out slightly negative.
        let grid = TimeGrid::unit(100).unwrap();
        let k = build_kernel(grid.as_slice(), 1.0, 5.0, 0.0).unwrap();
        let f = factorize(&k);
        assert!(f.factor().iter().all(|x| x.is_finite()));
        let err = max_abs_diff(&f.reconstruct(), k.matrix());
        assert!(err < 1e-6, "max error {err}");
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!(build_kernel(&[0.0, f64::NAN], 1.0, 0.1, 0.0).is_err());
        assert!(build_kernel(&[0.0, 1.0], 1.0, 0.0, 0.0).is_err());
        assert!(build_kernel(&[0.0, 1.0], 1.0, -0.2, 0.0).is_err());
        assert!(TimeGrid::new(vec![0.0, 0.5, 0.5]).is_err());
        assert!(TimeGrid::new(vec![]).is_err());
        assert!(TimeGrid::frames(10, 0.0).is_err());
    }

    #[test]
    fn test_tiny_length_scale_gives_independent_samples() {
        let grid = TimeGrid::unit(32).unwrap();
        let k = build_kernel(grid.as_slice(), 1.0, 1e-3, DEFAULT_JITTER).unwrap();
        let f = factorize(&k);
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let n = 4000;
        let mut lag1 = 0.0;
        let mut var = 0.0;
        for _ in 0..n {
            let x = f.draw(&mut rng);
            for i in 0..31 {
                lag1 += x[i] * x[i + 1];
            }
            var += x.iter().map(|v| v * v).sum::<f64>();
        }
        let corr = (lag1 / (31.0 * n as f64)) / (var / (32.0 * n as f64));
        assert!(corr.abs() < 0.05, "lag-1 autocorrelation {corr}");
    }

    #[test]
    fn test_first_differences_shrink_with_length_scale() {
        let grid = TimeGrid::unit(64).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let candidates = [0.001, 0.1, 0.2, 0.4, 0.6, 0.8, 1.0];

        let diff_vars: Vec<f64> = candidates
            .iter()
            .map(|&len| {
                let k = build_kernel(grid.as_slice(), 1.0, len, DEFAULT_JITTER).unwrap();
                let f = factorize(&k);
                let n = 2000;
                let mut acc = 0.0;
                for _ in 0..n {
                    let x = f.draw(&mut rng);
                    acc += (0..63).map(|i| (x[i + 1] - x[i]).powi(2)).sum::<f64>();
                }
                acc / (63.0 * n as f64)
            })
            .collect();

        for w in diff_vars.windows(2) {
            assert!(w[1] < w[0], "not decreasing: {diff_vars:?}");
        }
    }

    #[test]
    fn test_factor_tensor_is_row_major() {
        let grid = TimeGrid::unit(4).unwrap();
        let k = build_kernel(grid.as_slice(), 1.0, 0.3, DEFAULT_JITTER).unwrap();
        let f = factorize(&k);
        let t = f.to_tensor(&Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = t.to_vec2().unwrap();
        assert!((rows[1][2] as f64 - f.factor()[(1, 2)]).abs() < 1e-6);
        assert!((rows[2][1] as f64 - f.factor()[(2, 1)]).abs() < 1e-6);
    }
}
