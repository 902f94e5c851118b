//! Sample trajectories from a trained checkpoint.
//!
//! Reads `args.json` next to the checkpoint to rebuild the denoiser, then
//! runs the reverse process once per (length-scale, repetition) pair:
//!
//! ```text
//! <output-dir>/samples_len000_rep0.safetensors   motion [n, 1, 1, L]
//! ```
//!
//! Prints a one-line JSON summary to stdout on success.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use motion_gp_diffusion::config::RunConfig;
use motion_gp_diffusion::diffusion::{
    ClassifierFreeGuidance, Conditioning, GaussianDiffusion, SampleOptions, summarize,
};
use motion_gp_diffusion::kernel::{KernelBank, bank};
use motion_gp_diffusion::model::TrajectoryDenoiser;
use motion_gp_diffusion::noise::{CorrMode, CorrelationField};
use motion_gp_diffusion::tensor_io;
use motion_gp_diffusion::train::checkpoint;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

#[derive(Parser, Debug)]
#[command(
    name = "motion-gp-generate",
    about = "Generate samples from a diffusion model trained with GP noise"
)]
struct Args {
    /// Checkpoint file, or a save directory (latest checkpoint is used).
    #[arg(long)]
    model_path: PathBuf,

    /// Kernel parameter file. Defaults to the one recorded in args.json.
    #[arg(long)]
    kernel_file: Option<PathBuf>,

    /// Samples per length-scale and repetition.
    #[arg(long, default_value_t = 10)]
    num_samples: usize,

    #[arg(long, default_value_t = 1)]
    num_repetitions: usize,

    /// Correlation mode; defaults to the training mode.
    #[arg(long)]
    corr_mode: Option<String>,

    /// Comma-separated kernel bank indices; defaults to all.
    #[arg(long, value_delimiter = ',')]
    length_indices: Option<Vec<usize>>,

    /// Classifier-free guidance scale (conditioned models only).
    #[arg(long)]
    guidance_scale: Option<f64>,

    /// Reuse one noise draw for every reverse step.
    #[arg(long)]
    const_noise: bool,

    #[arg(long, short = 's', default_value_t = 10)]
    seed: u64,

    /// Output directory. Defaults to `samples_<checkpoint>_seed<seed>` next
    /// to the checkpoint.
    #[arg(long, short = 'o')]
    output_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.num_samples == 0 || args.num_repetitions == 0 {
        anyhow::bail!("num_samples and num_repetitions must be positive");
    }

    let model_path = if args.model_path.is_dir() {
        match checkpoint::find_latest_checkpoint(&args.model_path)? {
            Some(path) => path,
            None => anyhow::bail!("no checkpoint found in {}", args.model_path.display()),
        }
    } else {
        args.model_path.clone()
    };
    let model_dir = model_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let run = RunConfig::load(model_dir.join("args.json"))
        .map_err(|e| anyhow::anyhow!("failed to read args.json in {}: {e}", model_dir.display()))?;

    let kernel_file = match args.kernel_file.clone().or_else(|| run.kernel_file.clone()) {
        Some(path) => path,
        None => anyhow::bail!("no kernel file given and none recorded in args.json"),
    };
    let corr_mode = match &args.corr_mode {
        Some(mode) => mode.parse::<CorrMode>()?,
        None => run.train.corr_mode,
    };

    let device = Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    let bank = KernelBank::load(&kernel_file, &device)
        .map_err(|e| anyhow::anyhow!("failed to load kernel file: {e}"))?;
    let bank = bank::install(bank)?;
    let denoiser = &run.denoiser;
    if bank.dims() != denoiser.dims() || bank.num_frames() != denoiser.frames {
        anyhow::bail!(
            "kernel bank ({} dims, {} frames) does not match the model ({} dims, {} frames)",
            bank.dims(),
            bank.num_frames(),
            denoiser.dims(),
            denoiser.frames
        );
    }
    let length_indices: Vec<usize> = match args.length_indices.clone() {
        Some(indices) => indices,
        None => (0..bank.num_lengths()).collect(),
    };

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = TrajectoryDenoiser::new(denoiser, vb.pp("denoiser"))?;
    checkpoint::load_model(&varmap, &model_path, &run.train.frozen_prefixes)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", model_path.display()))?;
    let model = ClassifierFreeGuidance::new(model);
    let diffusion = GaussianDiffusion::new(&run.diffusion)?;

    let output_dir = args.output_dir.clone().unwrap_or_else(|| {
        let stem = model_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model");
        model_dir.join(format!("samples_{stem}_seed{}", args.seed))
    });
    std::fs::create_dir_all(&output_dir)?;

    if args.guidance_scale.is_some() && denoiser.cond_dim.is_none() {
        tracing::warn!("model is unconditioned, ignoring guidance scale");
    }

    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let opts = SampleOptions {
        const_noise: args.const_noise,
        ..Default::default()
    };
    let n = args.num_samples;
    let shape = [n, denoiser.channels, denoiser.joints, denoiser.frames];
    let mut files = Vec::new();

    for &index in &length_indices {
        let length_scale = bank.length_scale(index)?;
        let assignment = corr_mode.assignment(&bank, index, run.train.default_length)?;
        let field = CorrelationField::new(&bank, &assignment, &device)?;

        let mut cond = Conditioning::full(n, denoiser.frames);
        if denoiser.cond_dim.is_some() {
            // Conditioned runs (gp2) are conditioned on the length-scale.
            let embedding = Tensor::full(length_scale as f32, (n, 1), &device)?;
            cond = cond.with_embedding(embedding);
            if let Some(scale) = args.guidance_scale {
                cond = cond.with_guidance(scale);
            }
        }

        for rep in 0..args.num_repetitions {
            tracing::info!(length_index = index, length_scale, rep, "sampling");
            let sample = diffusion.p_sample_loop(&model, &shape, &cond, &field, &opts, &mut rng)?;
            let (mean, std, finite) = summarize(&sample)?;
            tracing::info!(length_index = index, rep, mean, std, finite, "sampled");

            let mut tensors = HashMap::new();
            tensors.insert("motion".to_string(), sample);
            tensors.insert(
                "length_scale".to_string(),
                Tensor::new(&[length_scale as f32], &device)?,
            );
            let path = output_dir.join(format!("samples_len{index:03}_rep{rep}.safetensors"));
            tensor_io::save_atomic(&tensors, &path)?;
            files.push(path);
        }
    }

    let summary = serde_json::json!({
        "output_dir": output_dir,
        "checkpoint": model_path,
        "corr_mode": corr_mode.name(),
        "files": files,
    });
    println!("{summary}");
    Ok(())
}
