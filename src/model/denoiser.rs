//! Small MLP denoiser over the frame axis.
//!
//! Each feature dimension's trajectory is projected to a hidden vector, the
//! step, length and (optional) text/action embeddings are added, and an MLP
//! maps it back to `L` frames:
//!
//! ```text
//! h_d = W_in x_d + e_dim[d] + W_len · len_d + temb(t) + W_cond · c
//! out_d = W_out SiLU(W_mid SiLU(h_d))
//! ```

use candle_core::{Module, Tensor};
use candle_nn::{self as nn, VarBuilder};

use super::timestep::TimestepEmbedding;
use crate::config::DenoiserConfig;
use crate::diffusion::{Conditioning, ScoreModel};
use crate::noise::CorrelationField;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct TrajectoryDenoiser {
    input_proj: nn::Linear,
    dim_embed: Tensor, // [dims, hidden]
    length_proj: nn::Linear,
    time_embed: TimestepEmbedding,
    cond_proj: Option<nn::Linear>,
    mid: nn::Linear,
    output_proj: nn::Linear,
    config: DenoiserConfig,
}

impl TrajectoryDenoiser {
    pub fn new(config: &DenoiserConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let f = config.frames;
        let cond_proj = match config.cond_dim {
            Some(dim) => Some(nn::linear(dim, h, vb.pp("cond_proj"))?),
            None => None,
        };
        Ok(Self {
            input_proj: nn::linear(f, h, vb.pp("input_proj"))?,
            dim_embed: vb.get_with_hints(
                (config.dims(), h),
                "dim_embed",
                nn::Init::Randn {
                    mean: 0.0,
                    stdev: 0.02,
                },
            )?,
            length_proj: nn::linear(1, h, vb.pp("length_proj"))?,
            time_embed: TimestepEmbedding::new(config.timestep_channels, h, vb.pp("time_embed"))?,
            cond_proj,
            mid: nn::linear(h, h, vb.pp("mid"))?,
            output_proj: nn::linear(h, f, vb.pp("output_proj"))?,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &DenoiserConfig {
        &self.config
    }
}

impl ScoreModel for TrajectoryDenoiser {
    fn forward(
        &self,
        x_t: &Tensor,
        timesteps: &Tensor,
        cond: &Conditioning,
        field: &CorrelationField,
    ) -> Result<Tensor> {
        let (b, c, j, f) = x_t.dims4()?;
        let dims = self.config.dims();
        if c * j != dims || f != self.config.frames || field.dims() != dims {
            return Err(Error::ShapeMismatch {
                expected: vec![b, self.config.channels, self.config.joints, self.config.frames],
                actual: x_t.dims().to_vec(),
            });
        }

        let x = x_t.reshape((b, dims, f))?;
        let mut h = x.apply(&self.input_proj)?.broadcast_add(&self.dim_embed)?;

        let lengths = field.lengths().to_dtype(x.dtype())?.reshape((dims, 1))?;
        h = h.broadcast_add(&lengths.apply(&self.length_proj)?)?;

        let temb = self.time_embed.forward(&timesteps.to_dtype(x.dtype())?)?;
        h = h.broadcast_add(&temb.unsqueeze(1)?)?;

        if let (Some(proj), Some(embedding)) = (&self.cond_proj, &cond.embedding) {
            let cemb = embedding.to_dtype(x.dtype())?.apply(proj)?;
            h = h.broadcast_add(&cemb.unsqueeze(1)?)?;
        }

        let out = h
            .silu()?
            .apply(&self.mid)?
            .silu()?
            .apply(&self.output_proj)?;
        Ok(out.reshape((b, c, j, f))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kernel::KernelBank;
    use crate::noise::CorrelationAssignment;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn field(dims: usize, frames: usize) -> CorrelationField {
        let config = KernelConfig {
            num_frames: frames,
            fps: None,
            dims,
            ..Default::default()
        };
        let bank = KernelBank::from_config(&config, &Device::Cpu).unwrap();
        CorrelationField::new(&bank, &CorrelationAssignment::template(dims, 0.03), &Device::Cpu)
            .unwrap()
    }

    #[test]
    fn test_output_matches_input_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let config = DenoiserConfig {
            hidden_size: 16,
            timestep_channels: 8,
            cond_dim: Some(4),
            ..DenoiserConfig::new(3, 2, 10)
        };
        let model = TrajectoryDenoiser::new(&config, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (5, 3, 2, 10), &dev).unwrap();
        let t = Tensor::new(&[0f32, 1.0, 2.0, 3.0, 4.0], &dev).unwrap();
        let emb = Tensor::randn(0f32, 1.0, (5, 4), &dev).unwrap();
        let cond = Conditioning::full(5, 10).with_embedding(emb);
        let out = model.forward(&x, &t, &cond, &field(6, 10)).unwrap();
        assert_eq!(out.dims(), &[5, 3, 2, 10]);

        // The embedding changes the prediction.
        let uncond = model.forward(&x, &t, &cond.without_embedding(), &field(6, 10)).unwrap();
        let diff: f32 = (out - uncond).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff > 0.0);
        assert!(varmap.all_vars().len() >= 10);
    }

    #[test]
    fn test_rejects_wrong_layout() {
        let dev = Device::Cpu;
        let model = TrajectoryDenoiser::new(
            &DenoiserConfig {
                hidden_size: 8,
                timestep_channels: 8,
                ..DenoiserConfig::new(1, 1, 6)
            },
            VarBuilder::zeros(DType::F32, &dev),
        )
        .unwrap();
        let x = Tensor::zeros((2, 2, 1, 6), DType::F32, &dev).unwrap();
        let t = Tensor::zeros(2, DType::F32, &dev).unwrap();
        let err = model
            .forward(&x, &t, &Conditioning::full(2, 6), &field(2, 6))
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
