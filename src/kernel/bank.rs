//! Precomputed kernel factorizations, one per length-scale, plus a near-white
//! template factor per feature dimension.
//!
//! A bank is built once (or loaded from a kernel parameter file) and then only
//! read. The on-disk layout is a safetensors file with:
//!
//! | name        | shape              | meaning                            |
//! |-------------|--------------------|------------------------------------|
//! | `template`  | `[dims, L, L]`     | per-dimension template factor      |
//! | `K_param`   | `[num_len, L, L]`  | factor for each length-scale       |
//! | `len_param` | `[num_len]`        | the length-scales                  |
//! | `times`     | `[L]` (optional)   | the time grid the kernels used     |

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use candle_core::{DType, Device, Tensor};

use super::{TimeGrid, build_kernel, factorize};
use crate::config::KernelConfig;
use crate::{Error, Result, tensor_io};

const TEMPLATE: &str = "template";
const FACTORS: &str = "K_param";
const LENGTHS: &str = "len_param";
const TIMES: &str = "times";

static GLOBAL_BANK: OnceLock<Arc<KernelBank>> = OnceLock::new();

/// Read-only collection of kernel factors.
#[derive(Debug, Clone)]
pub struct KernelBank {
    times: Option<Vec<f64>>,
    length_scales: Vec<f64>,
    factors: Tensor,  // [num_len, L, L]
    template: Tensor, // [dims, L, L]
}

impl KernelBank {
    /// Factorize one kernel per configured length-scale and the template kernel.
    pub fn build(times: &TimeGrid, config: &KernelConfig, device: &Device) -> Result<Self> {
        if config.length_scales.is_empty() {
            return Err(Error::Config("kernel bank needs at least one length-scale".into()));
        }
        if config.dims == 0 {
            return Err(Error::Config("kernel bank needs at least one dimension".into()));
        }

        let l = times.len();
        let mut factors = Vec::with_capacity(config.length_scales.len());
        for &length_scale in &config.length_scales {
            let kernel = build_kernel(times.as_slice(), config.gain, length_scale, config.jitter)?;
            factors.push(factorize(&kernel).to_tensor(device)?);
            tracing::debug!(length_scale, frames = l, "factorized kernel");
        }
        let factors = Tensor::stack(&factors, 0)?;

        let template_kernel = build_kernel(
            times.as_slice(),
            config.gain,
            config.template_length_scale,
            config.jitter,
        )?;
        let template = factorize(&template_kernel)
            .to_tensor(device)?
            .unsqueeze(0)?
            .broadcast_as((config.dims, l, l))?
            .contiguous()?;

        tracing::info!(
            frames = l,
            dims = config.dims,
            lengths = config.length_scales.len(),
            gain = config.gain,
            "built kernel bank"
        );

        Ok(Self {
            times: Some(times.as_slice().to_vec()),
            length_scales: config.length_scales.clone(),
            factors,
            template,
        })
    }

    /// Build from a config, deriving the time grid from `num_frames` and `fps`.
    pub fn from_config(config: &KernelConfig, device: &Device) -> Result<Self> {
        Self::build(&config.time_grid()?, config, device)
    }

    /// Load a kernel parameter file. Any missing or inconsistent entry is fatal.
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::kernel_file(path, "file not found"));
        }
        let tensors = tensor_io::load(path, device)
            .map_err(|e| Error::kernel_file(path, format!("unreadable: {e}")))?;

        let get = |name: &str| {
            tensors
                .get(name)
                .cloned()
                .ok_or_else(|| Error::kernel_file(path, format!("missing '{name}'")))
        };
        let template = get(TEMPLATE)?.to_dtype(DType::F32)?;
        let factors = get(FACTORS)?.to_dtype(DType::F32)?;
        let length_scales: Vec<f64> = get(LENGTHS)?.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
        let times = match tensors.get(TIMES) {
            Some(t) => Some(t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?),
            None => None,
        };

        let bank = Self::from_parts(times, length_scales, factors, template)
            .map_err(|e| Error::kernel_file(path, e.to_string()))?;
        tracing::info!(
            path = %path.display(),
            frames = bank.num_frames(),
            dims = bank.dims(),
            lengths = bank.num_lengths(),
            "loaded kernel bank"
        );
        Ok(bank)
    }

    /// Assemble a bank from tensors, checking ranks and shapes.
    pub fn from_parts(
        times: Option<Vec<f64>>,
        length_scales: Vec<f64>,
        factors: Tensor,
        template: Tensor,
    ) -> Result<Self> {
        let (num_len, l, l2) = factors
            .dims3()
            .map_err(|_| Error::Config(format!("{FACTORS} must be [num_len, L, L], got {:?}", factors.dims())))?;
        let (dims, tl, tl2) = template
            .dims3()
            .map_err(|_| Error::Config(format!("{TEMPLATE} must be [dims, L, L], got {:?}", template.dims())))?;

        if l != l2 || tl != tl2 || l != tl {
            return Err(Error::Config(format!(
                "factor shapes disagree: {FACTORS} {:?}, {TEMPLATE} {:?}",
                factors.dims(),
                template.dims()
            )));
        }
        if num_len == 0 || dims == 0 || l == 0 {
            return Err(Error::Config("kernel bank is empty".into()));
        }
        if length_scales.len() != num_len {
            return Err(Error::Config(format!(
                "{LENGTHS} has {} entries but {FACTORS} has {num_len}",
                length_scales.len()
            )));
        }
        if let Some(bad) = length_scales.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
            return Err(Error::Config(format!("invalid length-scale {bad}")));
        }
        if let Some(times) = &times
            && times.len() != l
        {
            return Err(Error::Config(format!(
                "{TIMES} has {} entries, kernels are {l}x{l}",
                times.len()
            )));
        }

        Ok(Self {
            times,
            length_scales,
            factors,
            template,
        })
    }

    /// Write the bank as a kernel parameter file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut tensors = HashMap::new();
        tensors.insert(TEMPLATE.to_string(), self.template.clone());
        tensors.insert(FACTORS.to_string(), self.factors.clone());
        tensors.insert(
            LENGTHS.to_string(),
            Tensor::new(self.length_scales.as_slice(), self.factors.device())?,
        );
        if let Some(times) = &self.times {
            tensors.insert(
                TIMES.to_string(),
                Tensor::new(times.as_slice(), self.factors.device())?,
            );
        }
        tensor_io::save_atomic(&tensors, path.as_ref())?;
        tracing::info!(path = %path.as_ref().display(), "saved kernel bank");
        Ok(())
    }

    /// Number of frames `L`.
    pub fn num_frames(&self) -> usize {
        self.factors.dim(1).unwrap_or(0)
    }

    /// Number of feature dimensions covered by the template.
    pub fn dims(&self) -> usize {
        self.template.dim(0).unwrap_or(0)
    }

    pub fn num_lengths(&self) -> usize {
        self.length_scales.len()
    }

    pub fn length_scales(&self) -> &[f64] {
        &self.length_scales
    }

    pub fn length_scale(&self, index: usize) -> Result<f64> {
        self.length_scales.get(index).copied().ok_or_else(|| {
            Error::Config(format!(
                "length index {index} out of range for a bank of {}",
                self.length_scales.len()
            ))
        })
    }

    pub fn times(&self) -> Option<&[f64]> {
        self.times.as_deref()
    }

    /// All length-scale factors `[num_len, L, L]`.
    pub fn factors(&self) -> &Tensor {
        &self.factors
    }

    /// Per-dimension template factors `[dims, L, L]`.
    pub fn template(&self) -> &Tensor {
        &self.template
    }

    pub fn device(&self) -> &Device {
        self.factors.device()
    }
}

/// Install the process-wide bank. Fails if one is already installed.
pub fn install(bank: KernelBank) -> Result<Arc<KernelBank>> {
    let bank = Arc::new(bank);
    GLOBAL_BANK
        .set(Arc::clone(&bank))
        .map_err(|_| Error::Config("kernel bank already installed".into()))?;
    Ok(bank)
}

/// The process-wide bank, if one was installed.
pub fn global() -> Option<Arc<KernelBank>> {
    GLOBAL_BANK.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::DEFAULT_JITTER;
    use crate::noise::{CorrelationAssignment, CorrelationField, KernelChoice, Override, assign_correlation};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn small_config() -> KernelConfig {
        KernelConfig {
            num_frames: 12,
            fps: None,
            dims: 3,
            gain: 0.5,
            jitter: DEFAULT_JITTER,
            template_length_scale: 1e-4,
            length_scales: vec![0.1, 0.5],
        }
    }

    #[test]
    fn test_build_shapes() {
        let bank = KernelBank::from_config(&small_config(), &Device::Cpu).unwrap();
        assert_eq!(bank.num_frames(), 12);
        assert_eq!(bank.dims(), 3);
        assert_eq!(bank.num_lengths(), 2);
        assert_eq!(bank.factors().dims(), &[2, 12, 12]);
        assert_eq!(bank.template().dims(), &[3, 12, 12]);
        assert!(bank.length_scale(2).is_err());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.safetensors");
        let bank = KernelBank::from_config(&small_config(), &Device::Cpu).unwrap();
        bank.save(&path).unwrap();

        let loaded = KernelBank::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.length_scales(), bank.length_scales());
        assert_eq!(loaded.times().unwrap().len(), 12);
        let diff: f32 = (loaded.factors() - bank.factors())
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_load_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.safetensors");
        assert!(matches!(
            KernelBank::load(&missing, &Device::Cpu),
            Err(Error::KernelFile { .. })
        ));

        // A file without the template tensor.
        let partial = dir.path().join("partial.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            FACTORS.to_string(),
            Tensor::zeros((1, 4, 4), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            LENGTHS.to_string(),
            Tensor::new(&[0.1f64], &Device::Cpu).unwrap(),
        );
        tensor_io::save_atomic(&tensors, &partial).unwrap();
        let err = KernelBank::load(&partial, &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("template"), "{err}");

        // Garbage bytes.
        let garbage = dir.path().join("garbage.safetensors");
        std::fs::write(&garbage, b"not a tensor file").unwrap();
        assert!(matches!(
            KernelBank::load(&garbage, &Device::Cpu),
            Err(Error::KernelFile { .. })
        ));
    }

    #[test]
    fn test_from_parts_rejects_mismatched_frames() {
        let factors = Tensor::zeros((2, 5, 5), DType::F32, &Device::Cpu).unwrap();
        let template = Tensor::zeros((3, 6, 6), DType::F32, &Device::Cpu).unwrap();
        assert!(KernelBank::from_parts(None, vec![0.1, 0.2], factors, template).is_err());
    }

    #[test]
    fn test_install_is_write_once() {
        let bank = KernelBank::from_config(&small_config(), &Device::Cpu).unwrap();
        let installed = install(bank.clone()).unwrap();
        assert_eq!(installed.num_lengths(), 2);
        assert!(install(bank).is_err());
        assert_eq!(global().unwrap().dims(), 3);
    }

    /// Empirical covariance of correlated draws matches the analytic kernel.
    #[test]
    fn test_empirical_covariance_matches_kernel() {
        let frames = 196;
        let config = KernelConfig {
            num_frames: frames,
            fps: None,
            dims: 1,
            gain: 1.0,
            jitter: DEFAULT_JITTER,
            template_length_scale: 1e-4,
            length_scales: vec![0.033, 1.0],
        };
        let times = config.time_grid().unwrap();
        let bank = KernelBank::build(&times, &config, &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        for (index, &length_scale) in config.length_scales.iter().enumerate() {
            let assignment = assign_correlation(
                &CorrelationAssignment::template(1, 0.03),
                &[Override::new(0..1, index, length_scale)],
            )
            .unwrap();
            assert_eq!(assignment.get(0).unwrap().kernel, KernelChoice::LengthScale(index));
            let field = CorrelationField::new(&bank, &assignment, &Device::Cpu).unwrap();

            // Enough draws that sampling error stays well inside the tolerance
            // for the near-white short length-scale.
            let n = 10_000;
            let samples = field.sample_noise(n, &mut rng).unwrap(); // [n, 1, L]
            let x = samples.reshape((n, frames)).unwrap().to_dtype(DType::F64).unwrap();
            let cov = (x.t().unwrap().matmul(&x).unwrap() / n as f64).unwrap();
            let cov: Vec<Vec<f64>> = cov.to_vec2().unwrap();

            let kernel = build_kernel(times.as_slice(), 1.0, length_scale, DEFAULT_JITTER).unwrap();
            let mut err = 0.0;
            let mut norm = 0.0;
            for i in 0..frames {
                for j in 0..frames {
                    let k = kernel.matrix()[(i, j)];
                    err += (cov[i][j] - k).powi(2);
                    norm += k * k;
                }
            }
            let rel = (err / norm).sqrt();
            assert!(rel < 0.1, "length-scale {length_scale}: relative error {rel}");
        }
    }
}
