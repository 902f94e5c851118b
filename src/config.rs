//! Configuration for kernels, diffusion, the reference denoiser and training.
//!
//! Defaults follow the HumanML3D setup: 196 frames at 20 fps, 263 feature
//! channels, a cosine schedule with 1000 steps and x0-prediction.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::kernel::TimeGrid;
use crate::noise::CorrMode;
use crate::{Error, Result, tensor_io};

/// Length-scales of the precomputed kernel bank (seconds).
pub const DEFAULT_LENGTH_SCALES: [f64; 7] = [
    0.033, 0.14044444, 0.24788889, 0.35533333, 0.46277778, 0.67766667, 1.0,
];

/// Gaussian-process kernel bank configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Number of frames `L`.
    #[serde(default = "default_num_frames")]
    pub num_frames: usize,

    /// Frame rate. `None` places the frames on the unit interval instead.
    #[serde(default = "default_fps")]
    pub fps: Option<f64>,

    /// Number of feature dimensions that get a template factor.
    #[serde(default = "default_dims")]
    pub dims: usize,

    /// Kernel gain (marginal variance of the correlated noise).
    #[serde(default = "default_gain")]
    pub gain: f64,

    /// Diagonal jitter added before factorization.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Length-scale of the near-white template kernel.
    #[serde(default = "default_template_length_scale")]
    pub template_length_scale: f64,

    /// Ordered length-scales, one factorization each.
    #[serde(default = "default_length_scales")]
    pub length_scales: Vec<f64>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            num_frames: default_num_frames(),
            fps: default_fps(),
            dims: default_dims(),
            gain: default_gain(),
            jitter: default_jitter(),
            template_length_scale: default_template_length_scale(),
            length_scales: default_length_scales(),
        }
    }
}

impl KernelConfig {
    /// Time grid implied by `num_frames` and `fps`.
    pub fn time_grid(&self) -> Result<TimeGrid> {
        match self.fps {
            Some(fps) => TimeGrid::frames(self.num_frames, fps),
            None => TimeGrid::unit(self.num_frames),
        }
    }
}

fn default_num_frames() -> usize {
    196
}

fn default_fps() -> Option<f64> {
    Some(20.0)
}

fn default_dims() -> usize {
    263
}

fn default_gain() -> f64 {
    0.1
}

fn default_jitter() -> f64 {
    1e-6
}

fn default_template_length_scale() -> f64 {
    1e-4
}

fn default_length_scales() -> Vec<f64> {
    DEFAULT_LENGTH_SCALES.to_vec()
}

/// Beta schedule of the forward process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    Cosine,
}

/// What the score model predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMeanType {
    /// The injected noise.
    Epsilon,
    /// The clean sample `x_0`.
    StartX,
}

/// Reverse-process variance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVarType {
    /// Posterior variance `β̃_t`.
    FixedSmall,
    /// `β_t`, with the first entry replaced by `β̃_1`.
    FixedLarge,
}

/// Diffusion process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    #[serde(default = "default_num_timesteps")]
    pub num_timesteps: usize,

    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: BetaSchedule,

    #[serde(default = "default_mean_type")]
    pub mean_type: ModelMeanType,

    #[serde(default = "default_var_type")]
    pub var_type: ModelVarType,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            num_timesteps: default_num_timesteps(),
            beta_schedule: default_beta_schedule(),
            mean_type: default_mean_type(),
            var_type: default_var_type(),
        }
    }
}

fn default_num_timesteps() -> usize {
    1000
}

fn default_beta_schedule() -> BetaSchedule {
    BetaSchedule::Cosine
}

fn default_mean_type() -> ModelMeanType {
    ModelMeanType::StartX
}

fn default_var_type() -> ModelVarType {
    ModelVarType::FixedSmall
}

/// Reference denoiser configuration (1-D toy experiments).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenoiserConfig {
    pub channels: usize,
    pub joints: usize,
    pub frames: usize,

    /// Width of the hidden MLP layers.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Dimension of the sinusoidal timestep embedding.
    #[serde(default = "default_timestep_channels")]
    pub timestep_channels: usize,

    /// Dimension of the text/action embedding, if conditioned.
    #[serde(default)]
    pub cond_dim: Option<usize>,
}

impl DenoiserConfig {
    pub fn new(channels: usize, joints: usize, frames: usize) -> Self {
        Self {
            channels,
            joints,
            frames,
            hidden_size: default_hidden_size(),
            timestep_channels: default_timestep_channels(),
            cond_dim: None,
        }
    }

    /// Flattened feature dimensions (`channels * joints`).
    pub fn dims(&self) -> usize {
        self.channels * self.joints
    }
}

fn default_hidden_size() -> usize {
    256
}

fn default_timestep_channels() -> usize {
    128
}

/// How diffusion timesteps are drawn during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSampling {
    Uniform,
    LossSecondMoment,
}

/// How the bank length-scale is chosen for each training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthSampling {
    /// Uniformly random bank index per step.
    Random,
    /// Always the same bank index.
    Fixed { index: usize },
}

/// Training loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_lr")]
    pub lr: f64,

    #[serde(default)]
    pub weight_decay: f64,

    /// Linear LR anneal budget; 0 disables annealing.
    #[serde(default)]
    pub lr_anneal_steps: usize,

    /// Total step budget.
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,

    #[serde(default = "default_log_interval")]
    pub log_interval: usize,

    #[serde(default = "default_save_interval")]
    pub save_interval: usize,

    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,

    #[serde(default)]
    pub resume_checkpoint: Option<PathBuf>,

    #[serde(default = "default_timestep_sampling")]
    pub timestep_sampling: TimestepSampling,

    #[serde(default = "default_corr_mode")]
    pub corr_mode: CorrMode,

    #[serde(default = "default_length_sampling")]
    pub length_sampling: LengthSampling,

    /// Per-dimension length fed to the model for template dimensions.
    #[serde(default = "default_length")]
    pub default_length: f64,

    #[serde(default = "default_true")]
    pub eval_during_training: bool,

    /// Bank indices sampled at every evaluation.
    #[serde(default = "default_eval_length_indices")]
    pub eval_length_indices: Vec<usize>,

    /// Sequences generated per evaluation length.
    #[serde(default = "default_eval_batch_size")]
    pub eval_batch_size: usize,

    /// Parameter name prefixes excluded from model checkpoints.
    #[serde(default = "default_frozen_prefixes")]
    pub frozen_prefixes: Vec<String>,

    /// Stop after the first checkpoint past step 0.
    #[serde(default)]
    pub test_mode: bool,

    #[serde(default)]
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            lr: default_lr(),
            weight_decay: 0.0,
            lr_anneal_steps: 0,
            num_steps: default_num_steps(),
            log_interval: default_log_interval(),
            save_interval: default_save_interval(),
            save_dir: default_save_dir(),
            resume_checkpoint: None,
            timestep_sampling: default_timestep_sampling(),
            corr_mode: default_corr_mode(),
            length_sampling: default_length_sampling(),
            default_length: default_length(),
            eval_during_training: true,
            eval_length_indices: default_eval_length_indices(),
            eval_batch_size: default_eval_batch_size(),
            frozen_prefixes: default_frozen_prefixes(),
            test_mode: false,
            seed: 0,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if self.log_interval == 0 || self.save_interval == 0 {
            return Err(Error::Config(
                "log_interval and save_interval must be positive".into(),
            ));
        }
        if self.eval_during_training && self.eval_batch_size == 0 {
            return Err(Error::Config("eval_batch_size must be positive".into()));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(Error::Config(format!("invalid learning rate {}", self.lr)));
        }
        Ok(())
    }
}

fn default_batch_size() -> usize {
    64
}

fn default_lr() -> f64 {
    1e-4
}

fn default_num_steps() -> usize {
    600_000
}

fn default_log_interval() -> usize {
    1_000
}

fn default_save_interval() -> usize {
    50_000
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("save")
}

fn default_timestep_sampling() -> TimestepSampling {
    TimestepSampling::Uniform
}

fn default_corr_mode() -> CorrMode {
    CorrMode::Trs
}

fn default_length_sampling() -> LengthSampling {
    LengthSampling::Random
}

fn default_length() -> f64 {
    0.03
}

fn default_true() -> bool {
    true
}

fn default_eval_length_indices() -> Vec<usize> {
    vec![0]
}

fn default_eval_batch_size() -> usize {
    1
}

fn default_frozen_prefixes() -> Vec<String> {
    vec!["clip_model.".to_string()]
}

/// Everything a training run needs to be reproduced; written as `args.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub diffusion: DiffusionConfig,
    #[serde(default)]
    pub denoiser: DenoiserConfig,
    #[serde(default)]
    pub train: TrainConfig,

    /// Kernel parameter file the run was trained with.
    #[serde(default)]
    pub kernel_file: Option<PathBuf>,

    /// Synthetic trajectory type of the training set.
    #[serde(default)]
    pub dataset: Option<String>,

    #[serde(default = "default_num_trajectories")]
    pub num_trajectories: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            diffusion: DiffusionConfig::default(),
            denoiser: DenoiserConfig::default(),
            train: TrainConfig::default(),
            kernel_file: None,
            dataset: None,
            num_trajectories: default_num_trajectories(),
        }
    }
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        tensor_io::write_atomic(serde_json::to_string_pretty(self)?.as_bytes(), path)
    }
}

fn default_num_trajectories() -> usize {
    1_000
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self::new(1, 1, 64)
    }
}
