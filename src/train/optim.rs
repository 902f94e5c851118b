//! AdamW with named, persistable state.
//!
//! The update matches `candle_nn::AdamW` (bias-corrected moments, decoupled
//! weight decay):
//!
//! ```text
//! m ← β₁ m + (1 - β₁) g
//! v ← β₂ v + (1 - β₂) g²
//! θ ← θ (1 - lr λ) - lr · m̂ / (sqrt(v̂) + ε)
//! ```
//!
//! Moments are keyed by variable name so they can be written next to the
//! model checkpoint and restored on resume.

use std::collections::HashMap;
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::{Error, Result, tensor_io};

const STEP_KEY: &str = "step";

#[derive(Debug)]
struct Slot {
    name: String,
    var: Var,
    m: Var,
    v: Var,
}

#[derive(Debug)]
pub struct NamedAdamW {
    slots: Vec<Slot>,
    step_t: usize,
    params: ParamsAdamW,
}

impl NamedAdamW {
    fn from_named(vars: Vec<(String, Var)>, params: ParamsAdamW) -> candle_core::Result<Self> {
        let slots = vars
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                let m = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let v = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(Slot { name, var, m, v })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            step_t: 0,
            params,
        })
    }

    /// Optimizer over every variable of `varmap` not under a frozen prefix.
    pub fn from_varmap(varmap: &VarMap, params: ParamsAdamW, frozen: &[String]) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| Error::Checkpoint("variable map lock poisoned".into()))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| !frozen.iter().any(|p| name.starts_with(p.as_str())))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self::from_named(vars, params)?)
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> usize {
        self.step_t
    }

    pub fn num_params(&self) -> usize {
        self.slots.len()
    }

    pub fn params(&self) -> &ParamsAdamW {
        &self.params
    }

    fn device(&self) -> Device {
        self.slots
            .first()
            .map(|slot| slot.var.device().clone())
            .unwrap_or(Device::Cpu)
    }

    pub fn save_state(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut tensors = HashMap::with_capacity(2 * self.slots.len() + 1);
        for slot in &self.slots {
            tensors.insert(format!("{}.m", slot.name), slot.m.as_tensor().detach());
            tensors.insert(format!("{}.v", slot.name), slot.v.as_tensor().detach());
        }
        tensors.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step_t as u32], &self.device())?,
        );
        tensor_io::save_atomic(&tensors, path)
    }

    /// Restore moments and step count written by [`save_state`](Self::save_state).
    pub fn load_state(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tensors = tensor_io::load(path, &self.device())?;
        let missing = |key: &str| Error::Checkpoint(format!("{} is missing '{key}'", path.display()));

        for slot in &self.slots {
            for (suffix, target) in [("m", &slot.m), ("v", &slot.v)] {
                let key = format!("{}.{suffix}", slot.name);
                let tensor = tensors.get(&key).ok_or_else(|| missing(&key))?;
                if tensor.dims() != target.dims() {
                    return Err(Error::ShapeMismatch {
                        expected: target.dims().to_vec(),
                        actual: tensor.dims().to_vec(),
                    });
                }
                target.set(&tensor.to_dtype(target.dtype())?)?;
            }
        }
        let step = tensors.get(STEP_KEY).ok_or_else(|| missing(STEP_KEY))?;
        let step = step.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
        self.step_t = step.first().copied().unwrap_or(0) as usize;
        Ok(())
    }
}

impl Optimizer for NamedAdamW {
    type Config = ParamsAdamW;

    fn new(vars: Vec<Var>, params: ParamsAdamW) -> candle_core::Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, var)| (format!("param{i}"), var))
            .collect();
        Self::from_named(named, params)
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_t += 1;
        let lr = self.params.lr;
        let (beta1, beta2) = (self.params.beta1, self.params.beta2);
        let eps = self.params.eps;
        let weight_decay = self.params.weight_decay;
        let scale_m = 1.0 / (1.0 - beta1.powi(self.step_t as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(self.step_t as i32));

        for slot in &self.slots {
            let Some(g) = grads.get(&slot.var) else {
                continue;
            };
            let next_m = ((slot.m.as_tensor() * beta1)? + (g * (1.0 - beta1))?)?;
            let next_v = ((slot.v.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let decayed = (slot.var.as_tensor() * (1.0 - lr * weight_decay))?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let next = (decayed - (update * lr)?)?;
            slot.m.set(&next_m)?;
            slot.v.set(&next_v)?;
            slot.var.set(&next)?;
        }
        Ok(())
    }
}
