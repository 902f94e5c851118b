//! Motion diffusion with Gaussian-process correlated noise, in pure Rust.
//!
//! A candle-based denoising diffusion toolkit in which the white Gaussian
//! noise of the forward and reverse processes is replaced by noise that is
//! smooth along the frame axis. Each feature dimension draws from a
//! squared-exponential GP kernel whose length-scale is chosen per dimension.
//!
//! ## Architecture
//!
//! ```text
//! length-scales ──→ kernel bank (K = F Fᵀ per length-scale + template)
//!                        ↓
//! corr mode ──→ per-dimension assignment ──→ correlation field
//!                        ↓                          ↓
//!   x_0 ──→ q_sample(x_0, t, ε ~ field) ──→ score model ──→ masked MSE
//!                        ↓
//!   x_T ~ field ──→ p_sample × T ──→ x_0
//! ```
//!
//! ## Modules
//!
//! - [`kernel`]: SE kernels, eigen-factorization, kernel bank file
//! - [`noise`]: correlation assignment and correlated noise sampling
//! - [`synth`]: synthetic 1-D trajectory datasets
//! - [`diffusion`]: schedules, forward/reverse process, guidance
//! - [`model`]: reference trajectory denoiser
//! - [`train`]: training session, checkpoints, optimizer state

pub mod config;
pub mod diffusion;
pub mod kernel;
pub mod model;
pub mod noise;
pub mod synth;
pub mod tensor_io;
pub mod train;

mod error;

pub use error::{Error, Result};
