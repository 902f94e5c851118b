//! Sinusoidal timestep embedding for the reference denoiser.
//!
//! Integer diffusion steps are mapped to
//! sinusoidal features → Linear → SiLU → Linear.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{self as nn, Module, VarBuilder};

const MAX_PERIOD: f64 = 10000.0;

/// Diffusion-step embedding `[B] → [B, D]`.
#[derive(Debug, Clone)]
pub struct TimestepEmbedding {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
    in_channels: usize,
}

impl TimestepEmbedding {
    /// - `in_channels`: width of the sinusoidal features (even)
    /// - `embed_dim`: output width
    pub fn new(in_channels: usize, embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        if in_channels == 0 || in_channels % 2 != 0 {
            candle_core::bail!("timestep channels must be a positive even number, got {in_channels}");
        }
        Ok(Self {
            linear_1: nn::linear(in_channels, embed_dim, vb.pp("linear_1"))?,
            linear_2: nn::linear(embed_dim, embed_dim, vb.pp("linear_2"))?,
            in_channels,
        })
    }

    /// `t`: [B] step indices → [B, in_channels], `cat[cos, sin]`.
    pub fn sinusoidal(&self, t: &Tensor, dev: &Device) -> Result<Tensor> {
        let half = self.in_channels / 2;
        let freqs: Vec<f32> = (0..half)
            .map(|i| (-(MAX_PERIOD.ln()) * i as f64 / half as f64).exp() as f32)
            .collect();
        let freqs = Tensor::new(freqs.as_slice(), dev)?;

        let args = t
            .to_dtype(DType::F32)?
            .unsqueeze(1)?
            .broadcast_mul(&freqs.unsqueeze(0)?)?;
        Tensor::cat(&[&args.cos()?, &args.sin()?], 1)
    }
}

impl Module for TimestepEmbedding {
    fn forward(&self, t: &Tensor) -> Result<Tensor> {
        let dtype = t.dtype();
        self.sinusoidal(t, t.device())?
            .to_dtype(dtype)?
            .apply(&self.linear_1)?
            .silu()?
            .apply(&self.linear_2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_shape() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let te = TimestepEmbedding::new(64, 32, vb.pp("te")).unwrap();
        let t = Tensor::new(&[0f32, 500.0, 999.0], &dev).unwrap();
        assert_eq!(te.forward(&t).unwrap().dims(), &[3, 32]);
        assert!(TimestepEmbedding::new(63, 32, VarBuilder::zeros(DType::F32, &dev)).is_err());
    }

    #[test]
    fn test_sinusoidal_separates_neighbouring_steps() {
        let dev = Device::Cpu;
        let te = TimestepEmbedding::new(128, 8, VarBuilder::zeros(DType::F32, &dev)).unwrap();
        let emb = te.sinusoidal(&Tensor::new(&[10f32, 11.0], &dev).unwrap(), &dev).unwrap();
        let rows: Vec<Vec<f32>> = emb.to_vec2().unwrap();
        // The first frequency is 1, so column 0 is cos(t).
        assert!((rows[0][0] - 10f32.cos()).abs() < 1e-5);
        let diff: f32 = rows[0].iter().zip(&rows[1]).map(|(a, b)| (a - b).abs()).sum();
        assert!(diff > 0.1, "diff = {diff}");
    }
}
