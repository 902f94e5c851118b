//! Training data: the dataset seam and an epoch-shuffling loader.

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::diffusion::Conditioning;
use crate::synth::{self, TrajType};
use crate::{Error, Result};

/// One minibatch: motion `[b, c, j, f]` and its conditioning.
#[derive(Debug, Clone)]
pub struct MotionBatch {
    pub motion: Tensor,
    pub cond: Conditioning,
}

/// Indexable collection of motion sequences.
pub trait MotionDataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `[channels, joints, frames]` of every item.
    fn motion_shape(&self) -> [usize; 3];

    fn get_batch(&self, indices: &[usize]) -> Result<MotionBatch>;
}

/// Synthetic 1-D trajectories as single-channel, single-joint motion.
#[derive(Debug, Clone)]
pub struct TrajectoryDataset {
    motion: Tensor,             // [n, 1, 1, L]
    embeddings: Option<Tensor>, // [n, e]
}

impl TrajectoryDataset {
    /// Synthesize `n_traj` trajectories. `gp2` length-scales become the
    /// conditioning embedding.
    pub fn generate(
        traj_type: TrajType,
        n_traj: usize,
        frames: usize,
        seed: Option<u64>,
        device: &Device,
    ) -> Result<Self> {
        let batch = synth::generate(traj_type, n_traj, frames, seed, 0, device)?;
        let motion = batch.x0()?.unsqueeze(2)?;
        tracing::info!(traj_type = %traj_type, n_traj, frames, "synthesized dataset");
        Self::from_tensor(motion, batch.length_scales)
    }

    pub fn from_tensor(motion: Tensor, embeddings: Option<Tensor>) -> Result<Self> {
        let n = motion.dims4()?.0;
        if let Some(emb) = &embeddings
            && (emb.rank() != 2 || emb.dim(0)? != n)
        {
            return Err(Error::ShapeMismatch {
                expected: vec![n, emb.dims().last().copied().unwrap_or(1)],
                actual: emb.dims().to_vec(),
            });
        }
        Ok(Self { motion, embeddings })
    }

    pub fn embedding_dim(&self) -> Option<usize> {
        self.embeddings.as_ref().and_then(|e| e.dims().get(1).copied())
    }
}

impl MotionDataset for TrajectoryDataset {
    fn len(&self) -> usize {
        self.motion.dims().first().copied().unwrap_or(0)
    }

    fn motion_shape(&self) -> [usize; 3] {
        let d = self.motion.dims();
        [d[1], d[2], d[3]]
    }

    fn get_batch(&self, indices: &[usize]) -> Result<MotionBatch> {
        let n = self.len();
        if let Some(&bad) = indices.iter().find(|&&i| i >= n) {
            return Err(Error::Config(format!("dataset index {bad} outside 0..{n}")));
        }
        let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let ids = Tensor::from_vec(ids, indices.len(), self.motion.device())?;

        let motion = self.motion.index_select(&ids, 0)?;
        let mut cond = Conditioning::full(indices.len(), self.motion_shape()[2]);
        if let Some(emb) = &self.embeddings {
            cond = cond.with_embedding(emb.index_select(&ids, 0)?);
        }
        Ok(MotionBatch { motion, cond })
    }
}

/// Endless minibatch iterator reshuffling the dataset every epoch.
#[derive(Debug)]
pub struct EpochLoader {
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    epoch: usize,
}

impl EpochLoader {
    /// Batches of `min(batch_size, len)` items.
    pub fn new(len: usize, batch_size: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Config("dataset is empty".into()));
        }
        Ok(Self {
            order: (0..len).collect(),
            cursor: len,
            batch_size: batch_size.clamp(1, len),
            epoch: 0,
        })
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Indices of the next minibatch; an epoch's tail shorter than a batch is
    /// dropped.
    pub fn next_indices(&mut self, rng: &mut ChaCha8Rng) -> Vec<usize> {
        if self.cursor + self.batch_size > self.order.len() {
            self.order.shuffle(rng);
            self.cursor = 0;
            self.epoch += 1;
            tracing::debug!(epoch = self.epoch, "starting epoch");
        }
        let batch = self.order[self.cursor..self.cursor + self.batch_size].to_vec();
        self.cursor += self.batch_size;
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn test_trajectory_dataset_shapes() {
        let data = TrajectoryDataset::generate(TrajType::Gp2, 6, 16, Some(3), &Device::Cpu).unwrap();
        assert_eq!(data.len(), 6);
        assert_eq!(data.motion_shape(), [1, 1, 16]);
        assert_eq!(data.embedding_dim(), Some(1));

        let batch = data.get_batch(&[0, 5, 2]).unwrap();
        assert_eq!(batch.motion.dims(), &[3, 1, 1, 16]);
        assert_eq!(batch.cond.embedding.as_ref().unwrap().dims(), &[3, 1]);
        assert_eq!(batch.cond.lengths, vec![16; 3]);
        assert!(data.get_batch(&[6]).is_err());
    }

    #[test]
    fn test_loader_covers_epoch_without_repeats() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut loader = EpochLoader::new(10, 5).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..2 {
            seen.extend(loader.next_indices(&mut rng));
        }
        assert_eq!(seen.len(), 10);
        assert_eq!(loader.epoch(), 1);
        loader.next_indices(&mut rng);
        assert_eq!(loader.epoch(), 2);
    }

    #[test]
    fn test_loader_caps_batch_at_dataset_size() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut loader = EpochLoader::new(3, 64).unwrap();
        assert_eq!(loader.next_indices(&mut rng).len(), 3);
        assert!(EpochLoader::new(0, 4).is_err());
    }
}
