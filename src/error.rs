//! Error types for motion-gp-diffusion.

use std::path::PathBuf;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Malformed kernel input (time grid, gain, length-scale).
    #[error("kernel: {0}")]
    Kernel(String),

    /// Missing or malformed kernel parameter file.
    #[error("kernel file {path}: {reason}")]
    KernelFile { path: PathBuf, reason: String },

    /// Trajectory type name not in the synthesizer table.
    #[error("unknown trajectory type '{0}' (expected one of: step, step2, gp, gp2, triangle)")]
    UnknownTrajType(String),

    /// Correlation-assignment mode name not in the lookup table.
    #[error("unknown correlation mode '{0}' (expected one of: trs, trsrot, ric, all)")]
    UnknownCorrMode(String),

    /// Score-model output or sample shape disagrees with the configured shape.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// Checkpoint save/load error.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<tempfile::PersistError> for Error {
    fn from(error: tempfile::PersistError) -> Self {
        Error::Io(error.error)
    }
}

impl Error {
    pub(crate) fn kernel_file(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::KernelFile {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
