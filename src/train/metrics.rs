//! Running loss means, overall and per diffusion-step quartile.

use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct Mean {
    sum: f64,
    count: usize,
}

/// Accumulates per-sample losses between two log points.
#[derive(Debug)]
pub struct LossMetrics {
    num_timesteps: usize,
    values: BTreeMap<String, Mean>,
}

impl LossMetrics {
    pub fn new(num_timesteps: usize) -> Self {
        Self {
            num_timesteps: num_timesteps.max(1),
            values: BTreeMap::new(),
        }
    }

    fn push(&mut self, key: String, value: f64) {
        let entry = self.values.entry(key).or_default();
        entry.sum += value;
        entry.count += 1;
    }

    /// Record `key` for a batch: the batch mean under `key`, and each sample
    /// under `{key}_q{quartile}` of its timestep.
    pub fn record(&mut self, key: &str, timesteps: &[usize], values: &[f32]) {
        if values.is_empty() {
            return;
        }
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64;
        self.push(key.to_string(), mean);
        for (&t, &v) in timesteps.iter().zip(values) {
            let quartile = (4 * t / self.num_timesteps).min(3);
            self.push(format!("{key}_q{quartile}"), v as f64);
        }
    }

    /// Current mean of `key`, if anything was recorded.
    pub fn mean(&self, key: &str) -> Option<f64> {
        self.values
            .get(key)
            .filter(|m| m.count > 0)
            .map(|m| m.sum / m.count as f64)
    }

    /// Means of every key, sorted by name; clears the accumulators.
    pub fn dump(&mut self) -> Vec<(String, f64)> {
        let values = std::mem::take(&mut self.values);
        values
            .into_iter()
            .filter(|(_, m)| m.count > 0)
            .map(|(key, m)| (key, m.sum / m.count as f64))
            .collect()
    }
}
