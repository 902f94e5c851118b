//! Safetensors and run-file I/O with crash-safe writes.
//!
//! Files are written to a temporary sibling and renamed into place, so a
//! reader never observes a partially written checkpoint or kernel file.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use candle_core::{Device, Tensor};
use tempfile::NamedTempFile;

use crate::Result;

fn temp_sibling(path: &Path) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let suffix = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    Ok(tempfile::Builder::new()
        .prefix(".tmp-")
        .suffix(&suffix)
        .tempfile_in(dir)?)
}

/// Write `tensors` to `path` atomically.
pub fn save_atomic(tensors: &HashMap<String, Tensor>, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let tmp = temp_sibling(path)?;
    candle_core::safetensors::save(tensors, tmp.path())?;
    tmp.persist(path)?;
    Ok(())
}

/// Write `contents` to `path` atomically.
pub fn write_atomic(contents: &[u8], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut tmp = temp_sibling(path)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

/// Load every tensor of a safetensors file onto `device`.
pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<HashMap<String, Tensor>> {
    Ok(candle_core::safetensors::load(path.as_ref(), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_atomic_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("x.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "x".to_string(),
            Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap(),
        );
        save_atomic(&tensors, &path).unwrap();

        let loaded = load(&path, &Device::Cpu).unwrap();
        let x: Vec<f32> = loaded["x"].to_vec1().unwrap();
        assert_eq!(x, vec![1.0, 2.0, 3.0]);

        let names: Vec<String> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["x.safetensors".to_string()]);
    }

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("args.json");
        write_atomic(b"{\"a\": 1}", &path).unwrap();
        write_atomic(b"{\"a\": 2}", &path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\": 2}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_save_atomic_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("y.safetensors");
        for value in [1.0f32, 5.0] {
            let mut tensors = HashMap::new();
            tensors.insert("y".to_string(), Tensor::new(&[value], &Device::Cpu).unwrap());
            save_atomic(&tensors, &path).unwrap();
        }
        let loaded = load(&path, &Device::Cpu).unwrap();
        let y: Vec<f32> = loaded["y"].to_vec1().unwrap();
        assert_eq!(y, vec![5.0]);
    }
}
