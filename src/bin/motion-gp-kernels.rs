//! Precompute the Gaussian-process kernel parameter file.
//!
//! Builds one factorization per length-scale plus the near-white template
//! and writes them to a safetensors file:
//!
//! ```text
//! template   [dims, L, L]
//! K_param    [n_lengths, L, L]
//! len_param  [n_lengths]
//! times      [L]
//! ```
//!
//! Prints a one-line JSON summary to stdout on success.

use candle_core::Device;
use clap::Parser;
use motion_gp_diffusion::config::{DEFAULT_LENGTH_SCALES, KernelConfig};
use motion_gp_diffusion::kernel::KernelBank;

#[derive(Parser, Debug)]
#[command(
    name = "motion-gp-kernels",
    about = "Precompute GP kernel factorizations for correlated diffusion noise"
)]
struct Args {
    /// Number of frames per sequence.
    #[arg(long, default_value_t = 196)]
    frames: usize,

    /// Frame rate; the time grid spans `frames / fps` seconds.
    #[arg(long, default_value_t = 20.0, conflicts_with = "unit_grid")]
    fps: f64,

    /// Place the frames on [0, 1] instead of a frame-rate grid.
    #[arg(long)]
    unit_grid: bool,

    /// Feature dimensions that receive a template factor.
    #[arg(long, default_value_t = 263)]
    dims: usize,

    /// Kernel gain.
    #[arg(long, default_value_t = 0.1)]
    gain: f64,

    /// Diagonal jitter.
    #[arg(long, default_value_t = 1e-6)]
    jitter: f64,

    /// Comma-separated length-scales in seconds.
    #[arg(long, value_delimiter = ',')]
    length_scales: Option<Vec<f64>>,

    /// Output safetensors path.
    #[arg(long, short = 'o', default_value = "kernels.safetensors")]
    output: String,
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

    if args.frames < 2 {
        anyhow::bail!("need at least 2 frames, got {}", args.frames);
    }
    if args.dims == 0 {
        anyhow::bail!("dims must be positive");
    }
    if !args.unit_grid && !(args.fps.is_finite() && args.fps > 0.0) {
        anyhow::bail!("fps must be positive, got {}", args.fps);
    }
    let length_scales = args
        .length_scales
        .unwrap_or_else(|| DEFAULT_LENGTH_SCALES.to_vec());
    if length_scales.is_empty() {
        anyhow::bail!("at least one length-scale is required");
    }

    let config = KernelConfig {
        num_frames: args.frames,
        fps: (!args.unit_grid).then_some(args.fps),
        dims: args.dims,
        gain: args.gain,
        jitter: args.jitter,
        length_scales,
        ..Default::default()
    };

    // Eigendecompositions run in f64 on the host.
    let device = Device::Cpu;
    tracing::info!(
        frames = config.num_frames,
        dims = config.dims,
        lengths = config.length_scales.len(),
        "building kernel bank"
    );
    let bank = KernelBank::from_config(&config, &device)
        .map_err(|e| anyhow::anyhow!("failed to build kernel bank: {e}"))?;
    bank.save(&args.output)
        .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", args.output))?;

    let summary = serde_json::json!({
        "path": args.output,
        "frames": bank.num_frames(),
        "dims": bank.dims(),
        "length_scales": bank.length_scales(),
    });
    println!("{summary}");
    Ok(())
}
