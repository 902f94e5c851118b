//! Classifier-free guidance.
//!
//! ```text
//! out = uncond + s · (cond - uncond)
//! ```
//!
//! The unconditional pass sees the same motion, timestep, mask and
//! correlation field, only without the embedding.

use candle_core::Tensor;

use super::{Conditioning, ScoreModel};
use crate::Result;
use crate::noise::CorrelationField;

/// Wraps a [`ScoreModel`] and applies `Conditioning::guidance_scale`.
///
/// Without a scale, or without an embedding to drop, the wrapped model runs
/// once and its output is returned as is.
#[derive(Debug, Clone)]
pub struct ClassifierFreeGuidance<M> {
    model: M,
}

impl<M: ScoreModel> ClassifierFreeGuidance<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn inner(&self) -> &M {
        &self.model
    }
}

impl<M: ScoreModel> ScoreModel for ClassifierFreeGuidance<M> {
    fn forward(
        &self,
        x_t: &Tensor,
        timesteps: &Tensor,
        cond: &Conditioning,
        field: &CorrelationField,
    ) -> Result<Tensor> {
        let out = self.model.forward(x_t, timesteps, cond, field)?;
        let scale = match cond.guidance_scale {
            Some(scale) if cond.embedding.is_some() => scale,
            _ => return Ok(out),
        };
        let uncond = self
            .model
            .forward(x_t, timesteps, &cond.without_embedding(), field)?;
        Ok((&uncond + ((out - &uncond)? * scale)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::kernel::KernelBank;
    use crate::noise::CorrelationAssignment;
    use candle_core::{DType, Device};

    /// Outputs 1 with an embedding, 0 without.
    struct Switch;

    impl ScoreModel for Switch {
        fn forward(
            &self,
            x_t: &Tensor,
            _timesteps: &Tensor,
            cond: &Conditioning,
            _field: &CorrelationField,
        ) -> Result<Tensor> {
            let value = if cond.embedding.is_some() { 1.0 } else { 0.0 };
            Ok(x_t.ones_like()?.affine(value, 0.0)?)
        }
    }

    fn field() -> CorrelationField {
        let config = KernelConfig {
            num_frames: 4,
            fps: None,
            dims: 1,
            ..Default::default()
        };
        let bank = KernelBank::from_config(&config, &Device::Cpu).unwrap();
        CorrelationField::new(&bank, &CorrelationAssignment::template(1, 0.03), &Device::Cpu)
            .unwrap()
    }

    #[test]
    fn test_guided_output_extrapolates() {
        let x = Tensor::zeros((2, 1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let t = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        let emb = Tensor::zeros((2, 8), DType::F32, &Device::Cpu).unwrap();
        let cond = Conditioning::full(2, 4).with_embedding(emb).with_guidance(2.5);

        let guided = ClassifierFreeGuidance::new(Switch);
        let out: f32 = guided
            .forward(&x, &t, &cond, &field())
            .unwrap()
            .mean_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        // 0 + 2.5 · (1 - 0)
        assert!((out - 2.5).abs() < 1e-6, "out = {out}");
    }

    #[test]
    fn test_no_scale_is_a_single_pass() {
        let x = Tensor::zeros((1, 1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let t = Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let emb = Tensor::zeros((1, 8), DType::F32, &Device::Cpu).unwrap();
        let cond = Conditioning::full(1, 4).with_embedding(emb);

        let out: f32 = ClassifierFreeGuidance::new(Switch)
            .forward(&x, &t, &cond, &field())
            .unwrap()
            .mean_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(out, 1.0);
    }
}
