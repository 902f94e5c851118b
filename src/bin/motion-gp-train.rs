//! Train the reference denoiser on synthetic trajectories with GP noise.
//!
//! Checkpoints, optimizer state and evaluation samples are written to
//! `--save-dir`, together with `args.json` for `motion-gp-generate`.
//! Prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"steps":5000,"final_loss":0.012,"last_checkpoint":"save/model000005000.safetensors"}
//! ```

use std::path::PathBuf;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use motion_gp_diffusion::config::{DenoiserConfig, RunConfig};
use motion_gp_diffusion::diffusion::GaussianDiffusion;
use motion_gp_diffusion::kernel::{KernelBank, bank};
use motion_gp_diffusion::model::TrajectoryDenoiser;
use motion_gp_diffusion::noise::CorrMode;
use motion_gp_diffusion::synth::TrajType;
use motion_gp_diffusion::train::{TrainSession, TrajectoryDataset};

#[derive(Parser, Debug)]
#[command(
    name = "motion-gp-train",
    about = "Train a diffusion denoiser with Gaussian-process correlated noise"
)]
struct Args {
    /// Trajectory type: step, step2, gp, gp2 or triangle.
    #[arg(long)]
    dataset: String,

    /// Kernel parameter file from motion-gp-kernels.
    #[arg(long)]
    kernel_file: PathBuf,

    /// Base configuration (JSON, same layout as args.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of synthetic trajectories.
    #[arg(long)]
    num_trajectories: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    num_steps: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    log_interval: Option<usize>,

    #[arg(long)]
    save_interval: Option<usize>,

    /// Correlation mode: trs, trsrot, ric or all.
    #[arg(long)]
    corr_mode: Option<String>,

    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Checkpoint (`modelNNNNNNNNN.safetensors`) to resume from.
    #[arg(long)]
    resume_checkpoint: Option<PathBuf>,

    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Allow writing into a non-empty save directory.
    #[arg(long)]
    overwrite: bool,
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

    let mut run = match &args.config {
        Some(path) => RunConfig::load(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?,
        None => RunConfig::default(),
    };
    let traj_type: TrajType = args.dataset.parse()?;
    run.dataset = Some(traj_type.to_string());
    run.kernel_file = Some(args.kernel_file.clone());
    if let Some(n) = args.num_trajectories {
        run.num_trajectories = n;
    }
    let train = &mut run.train;
    if let Some(v) = args.batch_size {
        train.batch_size = v;
    }
    if let Some(v) = args.num_steps {
        train.num_steps = v;
    }
    if let Some(v) = args.lr {
        train.lr = v;
    }
    if let Some(v) = args.log_interval {
        train.log_interval = v;
    }
    if let Some(v) = args.save_interval {
        train.save_interval = v;
    }
    if let Some(mode) = &args.corr_mode {
        train.corr_mode = mode.parse::<CorrMode>()?;
    }
    if let Some(dir) = &args.save_dir {
        train.save_dir = dir.clone();
    }
    if let Some(path) = &args.resume_checkpoint {
        train.resume_checkpoint = Some(path.clone());
    }
    if let Some(seed) = args.seed {
        train.seed = seed;
    }
    train.validate()?;
    if run.num_trajectories == 0 {
        anyhow::bail!("num_trajectories must be positive");
    }

    let save_dir = run.train.save_dir.clone();
    let non_empty = save_dir.is_dir() && std::fs::read_dir(&save_dir)?.next().is_some();
    if non_empty && !args.overwrite && run.train.resume_checkpoint.is_none() {
        anyhow::bail!(
            "save directory {} is not empty (pass --overwrite or --resume-checkpoint)",
            save_dir.display()
        );
    }
    std::fs::create_dir_all(&save_dir)?;

    let device = Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    let bank = KernelBank::load(&args.kernel_file, &device)
        .map_err(|e| anyhow::anyhow!("failed to load kernel file: {e}"))?;
    if bank.dims() != 1 {
        anyhow::bail!(
            "trajectory training needs a 1-dimensional kernel bank, {} has {} dims",
            args.kernel_file.display(),
            bank.dims()
        );
    }
    if args.corr_mode.is_none() {
        let mode = run.train.corr_mode.fit_to_dims(bank.dims());
        if mode != run.train.corr_mode {
            tracing::info!(
                from = %run.train.corr_mode,
                to = %mode,
                "correlation mode does not fit the kernel bank, using all"
            );
            run.train.corr_mode = mode;
        }
    }
    let bank = bank::install(bank)?;

    let frames = bank.num_frames();
    // gp2 trajectories carry their length-scale as the conditioning embedding.
    run.denoiser = DenoiserConfig {
        hidden_size: run.denoiser.hidden_size,
        timestep_channels: run.denoiser.timestep_channels,
        cond_dim: matches!(traj_type, TrajType::Gp2).then_some(1),
        ..DenoiserConfig::new(1, 1, frames)
    };
    run.save(save_dir.join("args.json"))?;

    let dataset = TrajectoryDataset::generate(
        traj_type,
        run.num_trajectories,
        frames,
        Some(run.train.seed),
        &device,
    )?;
    if run.denoiser.cond_dim != dataset.embedding_dim() {
        anyhow::bail!(
            "denoiser expects embedding dim {:?}, dataset provides {:?}",
            run.denoiser.cond_dim,
            dataset.embedding_dim()
        );
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = TrajectoryDenoiser::new(&run.denoiser, vb.pp("denoiser"))?;
    let diffusion = GaussianDiffusion::new(&run.diffusion)?;

    let mut session = TrainSession::new(model, varmap, diffusion, bank, run.train.clone(), &device)
        .map_err(|e| anyhow::anyhow!("failed to set up training: {e}"))?;
    let summary = session
        .run_loop(&dataset)
        .map_err(|e| anyhow::anyhow!("training failed: {e}"))?;

    let out = serde_json::json!({
        "steps": summary.steps,
        "resume_step": summary.resume_step,
        "final_loss": summary.losses.last(),
        "last_checkpoint": summary.last_checkpoint,
    });
    println!("{out}");
    Ok(())
}
