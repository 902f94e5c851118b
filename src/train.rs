//! Training loop for a [`ScoreModel`] under correlated noise.
//!
//! A [`TrainSession`] owns everything one run needs (weights, optimizer,
//! diffusion, kernel bank, RNG) and steps through
//!
//! ```text
//! Running → AnnealingLr → [Checkpointing → [Evaluating]] → Running … → Done
//! ```
//!
//! - [`checkpoint`]: model file naming, save/load with frozen prefixes
//! - [`optim`]: AdamW whose moments are saved with each checkpoint
//! - [`data`]: [`MotionDataset`] seam and epoch loader
//! - [`metrics`]: running loss means per timestep quartile

pub mod checkpoint;
pub mod data;
pub mod metrics;
pub mod optim;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use crate::config::{LengthSampling, TrainConfig};
use crate::diffusion::{
    Conditioning, GaussianDiffusion, SampleOptions, ScheduleSampler, ScoreModel, create_sampler,
    summarize,
};
use crate::kernel::KernelBank;
use crate::noise::{CorrMode, CorrelationField};
use crate::{Error, Result, tensor_io};

pub use data::{EpochLoader, MotionBatch, MotionDataset, TrajectoryDataset};
pub use metrics::LossMetrics;
pub use optim::NamedAdamW;

/// Environment variable that stops training after the first checkpoint.
pub const TEST_MODE_ENV: &str = "DIFFUSION_TRAINING_TEST";

/// Where the loop is within one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    AnnealingLr,
    Checkpointing,
    Evaluating,
    Done,
}

/// Result of [`TrainSession::run_loop`].
#[derive(Debug, Clone, Serialize)]
pub struct TrainSummary {
    /// Steps taken in this run (excluding the resumed offset).
    pub steps: usize,
    pub resume_step: usize,
    /// Weighted training loss of every step.
    pub losses: Vec<f32>,
    pub last_checkpoint: Option<PathBuf>,
}

/// One correlation field per bank length index, built on first use.
#[derive(Debug)]
struct FieldCache {
    bank: Arc<KernelBank>,
    mode: CorrMode,
    default_length: f64,
    device: Device,
    fields: Vec<Option<CorrelationField>>,
}

impl FieldCache {
    fn new(bank: Arc<KernelBank>, mode: CorrMode, default_length: f64, device: Device) -> Self {
        let fields = (0..bank.num_lengths()).map(|_| None).collect();
        Self {
            bank,
            mode,
            default_length,
            device,
            fields,
        }
    }

    fn len(&self) -> usize {
        self.fields.len()
    }

    fn get(&mut self, index: usize) -> Result<&CorrelationField> {
        let slot = self.fields.get_mut(index).ok_or_else(|| {
            Error::Config(format!(
                "length index {index} outside 0..{}",
                self.bank.num_lengths()
            ))
        })?;
        if slot.is_none() {
            let assignment = self.mode.assignment(&self.bank, index, self.default_length)?;
            tracing::debug!(index, mode = %self.mode, "building correlation field");
            *slot = Some(CorrelationField::new(&self.bank, &assignment, &self.device)?);
        }
        slot.as_ref()
            .ok_or_else(|| Error::Config(format!("correlation field {index} unavailable")))
    }
}

/// Explicit training context.
pub struct TrainSession<M> {
    model: M,
    varmap: VarMap,
    diffusion: GaussianDiffusion,
    optimizer: NamedAdamW,
    sampler: Box<dyn ScheduleSampler>,
    fields: FieldCache,
    rng: ChaCha8Rng,
    device: Device,
    config: TrainConfig,
    metrics: LossMetrics,
    phase: Phase,
    test_mode: bool,
    last_checkpoint: Option<PathBuf>,

    pub step: usize,
    pub resume_step: usize,
    pub log_interval: usize,
    pub save_interval: usize,
    pub num_steps: usize,
    pub lr_anneal_steps: usize,
}

impl<M: ScoreModel> TrainSession<M> {
    /// Set up a session; resumes from `config.resume_checkpoint` if given.
    ///
    /// `varmap` must hold the variables `model` was built from.
    pub fn new(
        model: M,
        varmap: VarMap,
        diffusion: GaussianDiffusion,
        bank: Arc<KernelBank>,
        config: TrainConfig,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        config.corr_mode.check_dims(bank.dims())?;
        let num_lengths = bank.num_lengths();
        if let LengthSampling::Fixed { index } = config.length_sampling
            && index >= num_lengths
        {
            return Err(Error::Config(format!(
                "fixed length index {index} outside 0..{num_lengths}"
            )));
        }
        if let Some(&bad) = config.eval_length_indices.iter().find(|&&i| i >= num_lengths) {
            return Err(Error::Config(format!(
                "evaluation length index {bad} outside 0..{num_lengths}"
            )));
        }

        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = NamedAdamW::from_varmap(&varmap, params, &config.frozen_prefixes)?;
        let sampler = create_sampler(config.timestep_sampling, diffusion.num_timesteps());
        let metrics = LossMetrics::new(diffusion.num_timesteps());
        let fields = FieldCache::new(bank, config.corr_mode, config.default_length, device.clone());
        let test_mode =
            config.test_mode || std::env::var(TEST_MODE_ENV).is_ok_and(|v| !v.is_empty());

        tracing::info!(
            params = optimizer.num_params(),
            lengths = num_lengths,
            corr_mode = %config.corr_mode,
            seed = config.seed,
            test_mode,
            "training session ready"
        );

        let mut session = Self {
            model,
            varmap,
            diffusion,
            optimizer,
            sampler,
            fields,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            device: device.clone(),
            metrics,
            phase: Phase::Running,
            test_mode,
            last_checkpoint: None,
            step: 0,
            resume_step: 0,
            log_interval: config.log_interval,
            save_interval: config.save_interval,
            num_steps: config.num_steps,
            lr_anneal_steps: config.lr_anneal_steps,
            config,
        };
        if let Some(path) = session.config.resume_checkpoint.clone() {
            session.resume(&path)?;
        }
        Ok(session)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Step number used in checkpoint names.
    pub fn global_step(&self) -> usize {
        self.step + self.resume_step
    }

    fn resume(&mut self, path: &std::path::Path) -> Result<()> {
        let step = checkpoint::parse_resume_step(path).ok_or_else(|| {
            Error::Checkpoint(format!("cannot read a step from {}", path.display()))
        })?;
        checkpoint::load_model(&self.varmap, path, &self.config.frozen_prefixes)?;
        self.resume_step = step;

        let opt_path = path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join(checkpoint::opt_file_name(step));
        if opt_path.exists() {
            self.optimizer.load_state(&opt_path)?;
            tracing::info!(path = %opt_path.display(), "loaded optimizer state");
        } else {
            tracing::warn!(
                path = %opt_path.display(),
                "optimizer state not found, starting from fresh moments"
            );
        }
        tracing::info!(resume_step = step, "resumed");
        Ok(())
    }

    fn budget_exhausted(&self) -> bool {
        let annealed = self.lr_anneal_steps > 0 && self.global_step() >= self.lr_anneal_steps;
        annealed || self.global_step() >= self.num_steps
    }

    fn anneal_lr(&mut self) {
        if self.lr_anneal_steps == 0 {
            return;
        }
        let done = self.global_step() as f64 / self.lr_anneal_steps as f64;
        self.optimizer.set_learning_rate(self.config.lr * (1.0 - done));
    }

    /// One optimisation step on `batch`; returns the weighted loss.
    pub fn run_step(&mut self, batch: &MotionBatch) -> Result<f32> {
        let b = batch.motion.dim(0)?;
        let (timesteps, weights) = self.sampler.sample(b, &mut self.rng)?;
        let length_index = match self.config.length_sampling {
            LengthSampling::Random => self.rng.random_range(0..self.fields.len()),
            LengthSampling::Fixed { index } => index,
        };

        let field = self.fields.get(length_index)?;
        let losses = self.diffusion.training_losses(
            &self.model,
            &batch.motion,
            &timesteps,
            &batch.cond,
            field,
            &mut self.rng,
        )?;

        let per_sample: Vec<f32> = losses.loss.to_dtype(DType::F32)?.to_vec1()?;
        let as_f64: Vec<f64> = per_sample.iter().map(|&v| v as f64).collect();
        self.sampler.update_with_losses(&timesteps, &as_f64);

        let weighted: Vec<f32> = per_sample.iter().zip(&weights).map(|(l, w)| l * w).collect();
        let weights = Tensor::from_vec(weights, b, &self.device)?.to_dtype(losses.loss.dtype())?;
        let loss = (&losses.loss * &weights)?.mean_all()?;
        self.optimizer.backward_step(&loss)?;
        let value: f32 = loss.to_dtype(DType::F32)?.to_scalar()?;
        if !value.is_finite() {
            tracing::warn!(step = self.global_step(), loss = value, "non-finite loss");
        }

        self.phase = Phase::AnnealingLr;
        self.anneal_lr();

        let mse: Vec<f32> = losses.mse.to_dtype(DType::F32)?.to_vec1()?;
        // Importance-weighted, so `loss` matches the optimised objective.
        self.metrics.record("loss", &timesteps, &weighted);
        self.metrics.record("mse", &timesteps, &mse);
        tracing::debug!(step = self.global_step(), length_index, loss = value, "step");
        Ok(value)
    }

    fn log_metrics(&mut self) {
        let step = self.global_step();
        let lr = self.optimizer.learning_rate();
        for (key, value) in self.metrics.dump() {
            tracing::info!(step, lr, key = %key, value, "train");
        }
    }

    /// Write `model{step}` and `opt{step}` into the save directory.
    pub fn save(&mut self) -> Result<PathBuf> {
        self.phase = Phase::Checkpointing;
        let step = self.global_step();
        let dir = &self.config.save_dir;
        let model_path = dir.join(checkpoint::model_file_name(step));
        checkpoint::save_model(&self.varmap, &self.config.frozen_prefixes, &model_path)?;
        self.optimizer.save_state(dir.join(checkpoint::opt_file_name(step)))?;
        self.last_checkpoint = Some(model_path.clone());
        Ok(model_path)
    }

    /// Reverse-sample one batch per evaluation length index.
    pub fn evaluate(&mut self, shape: [usize; 3]) -> Result<()> {
        self.phase = Phase::Evaluating;
        let step = self.global_step();
        let [c, j, f] = shape;
        let batch = self.config.eval_batch_size;
        let cond = Conditioning::full(batch, f);
        let opts = SampleOptions::default();

        for index in self.config.eval_length_indices.clone() {
            let field = self.fields.get(index)?;
            let sample = self.diffusion.p_sample_loop(
                &self.model,
                &[batch, c, j, f],
                &cond,
                field,
                &opts,
                &mut self.rng,
            )?;
            let (mean, std, finite) = summarize(&sample)?;
            if !finite {
                tracing::warn!(step, length_index = index, "evaluation produced non-finite values");
            }

            let mut tensors = HashMap::new();
            tensors.insert("motion".to_string(), sample);
            let path = self.config.save_dir.join(checkpoint::eval_file_name(step, index));
            tensor_io::save_atomic(&tensors, &path)?;
            tracing::info!(step, length_index = index, mean, std, finite, "evaluation");
        }
        Ok(())
    }

    /// Train on `dataset` until a budget is exhausted.
    pub fn run_loop<D: MotionDataset>(&mut self, dataset: &D) -> Result<TrainSummary> {
        let shape = dataset.motion_shape();
        let bank = &self.fields.bank;
        if shape[0] * shape[1] != bank.dims() || shape[2] != bank.num_frames() {
            return Err(Error::ShapeMismatch {
                expected: vec![bank.dims(), bank.num_frames()],
                actual: vec![shape[0] * shape[1], shape[2]],
            });
        }

        let mut loader = EpochLoader::new(dataset.len(), self.config.batch_size)?;
        let mut losses = Vec::new();
        let mut final_save = true;
        tracing::info!(
            items = dataset.len(),
            batch_size = loader.batch_size(),
            resume_step = self.resume_step,
            num_steps = self.num_steps,
            "starting training"
        );

        self.phase = Phase::Running;
        while self.phase != Phase::Done {
            if self.budget_exhausted() {
                self.phase = Phase::Done;
                break;
            }

            let indices = loader.next_indices(&mut self.rng);
            let batch = dataset.get_batch(&indices)?;
            losses.push(self.run_step(&batch)?);

            if self.step % self.log_interval == 0 {
                self.log_metrics();
            }
            if self.step % self.save_interval == 0 {
                self.save()?;
                if self.config.eval_during_training {
                    self.evaluate(shape)?;
                }
                if self.test_mode && self.step > 0 {
                    tracing::info!(step = self.global_step(), "test mode, stopping");
                    final_save = false;
                    self.phase = Phase::Done;
                    break;
                }
            }
            self.step += 1;
            self.phase = Phase::Running;
        }

        if final_save && self.step > 0 && (self.step - 1) % self.save_interval != 0 {
            self.save()?;
            if self.config.eval_during_training {
                self.evaluate(shape)?;
            }
        }
        self.phase = Phase::Done;
        tracing::info!(steps = self.step, last_checkpoint = ?self.last_checkpoint, "training finished");

        Ok(TrainSummary {
            steps: self.step,
            resume_step: self.resume_step,
            losses,
            last_checkpoint: self.last_checkpoint.clone(),
        })
    }
}
