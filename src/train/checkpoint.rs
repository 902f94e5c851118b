//! Model checkpoints.
//!
//! ```text
//! <save_dir>/model000050000.safetensors   trainable weights
//! <save_dir>/opt000050000.safetensors     optimizer moments + step
//! <save_dir>/eval000050000_len0.safetensors
//! ```
//!
//! Step numbers are zero-padded to nine digits so that a lexical sort of
//! the directory is also a numeric one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use candle_nn::VarMap;

use crate::{Error, Result, tensor_io};

pub fn model_file_name(step: usize) -> String {
    format!("model{step:09}.safetensors")
}

pub fn opt_file_name(step: usize) -> String {
    format!("opt{step:09}.safetensors")
}

pub fn eval_file_name(step: usize, length_index: usize) -> String {
    format!("eval{step:09}_len{length_index}.safetensors")
}

/// Step encoded in a `modelNNNNNNNNN.safetensors` path.
///
/// Returns `None` when the file name does not follow that pattern.
pub fn parse_resume_step(path: impl AsRef<Path>) -> Option<usize> {
    let stem = path.as_ref().file_stem()?.to_str()?;
    let digits = stem.rsplit_once("model")?.1;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Latest `model*.safetensors` in `dir`, by step.
pub fn find_latest_checkpoint(dir: impl AsRef<Path>) -> Result<Option<PathBuf>> {
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("safetensors") {
            continue;
        }
        let Some(step) = parse_resume_step(&path) else {
            continue;
        };
        if best.as_ref().is_none_or(|(s, _)| step > *s) {
            best = Some((step, path));
        }
    }
    Ok(best.map(|(_, path)| path))
}

fn is_frozen(name: &str, frozen: &[String]) -> bool {
    frozen.iter().any(|prefix| name.starts_with(prefix.as_str()))
}

/// Snapshot of every trainable variable, frozen prefixes excluded.
pub fn trainable_tensors(varmap: &VarMap, frozen: &[String]) -> Result<HashMap<String, Tensor>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::Checkpoint("variable map lock poisoned".into()))?;
    Ok(data
        .iter()
        .filter(|(name, _)| !is_frozen(name, frozen))
        .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
        .collect())
}

/// Write the trainable weights of `varmap` to `path`.
pub fn save_model(varmap: &VarMap, frozen: &[String], path: impl AsRef<Path>) -> Result<()> {
    let tensors = trainable_tensors(varmap, frozen)?;
    tensor_io::save_atomic(&tensors, path.as_ref())?;
    tracing::info!(path = %path.as_ref().display(), tensors = tensors.len(), "saved model");
    Ok(())
}

/// Load weights from `path` into the existing variables of `varmap`.
///
/// Every non-frozen variable must be present in the file with the same
/// shape. Unknown names in the file are ignored with a warning.
pub fn load_model(varmap: &VarMap, path: impl AsRef<Path>, frozen: &[String]) -> Result<()> {
    let path = path.as_ref();
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::Checkpoint("variable map lock poisoned".into()))?;
    let device = match data.values().next() {
        Some(var) => var.device().clone(),
        None => return Err(Error::Checkpoint("model has no variables".into())),
    };
    let mut tensors = tensor_io::load(path, &device)?;

    for (name, var) in data.iter() {
        if is_frozen(name, frozen) {
            continue;
        }
        let tensor = tensors.remove(name).ok_or_else(|| {
            Error::Checkpoint(format!("{} is missing '{name}'", path.display()))
        })?;
        if tensor.dims() != var.dims() {
            return Err(Error::ShapeMismatch {
                expected: var.dims().to_vec(),
                actual: tensor.dims().to_vec(),
            });
        }
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }
    if !tensors.is_empty() {
        let mut extra: Vec<_> = tensors.into_keys().collect();
        extra.sort();
        tracing::warn!(?extra, "checkpoint has tensors the model does not use");
    }
    tracing::info!(path = %path.display(), "loaded model");
    Ok(())
}
