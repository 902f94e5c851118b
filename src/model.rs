//! Reference score model for the toy and motion experiments.
//!
//! - [`timestep`]: sinusoidal diffusion-step embedding
//! - [`denoiser`]: per-dimension MLP over frames implementing
//!   [`ScoreModel`](crate::diffusion::ScoreModel)

pub mod denoiser;
pub mod timestep;

pub use denoiser::TrajectoryDenoiser;
pub use timestep::TimestepEmbedding;
