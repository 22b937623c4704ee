//! Pre-normalised position-wise feed-forward used for the macaron half-steps.
//!
//! ```text
//! LayerNorm(d) → Linear(d, d_ffn) → act → Dropout → Linear(d_ffn, d) → Dropout
//! ```
//!
//! ## Weight key paths
//!
//! ```text
//! 0.{weight,bias}          — LayerNorm(d)
//! 1.ffn.0.{weight,bias}    — Linear(d, d_ffn)
//! 1.ffn.3.{weight,bias}    — Linear(d_ffn, d)
//! ```

use candle_core::{Module, Tensor};
use candle_nn::{Activation, VarBuilder};

use crate::Result;

#[derive(Debug, Clone)]
pub struct FeedForwardModule {
    norm: candle_nn::LayerNorm,
    w_1: candle_nn::Linear,
    w_2: candle_nn::Linear,
    activation: Activation,
    dropout: candle_nn::Dropout,
}

impl FeedForwardModule {
    pub fn load(
        vb: VarBuilder,
        dim: usize,
        hidden: usize,
        activation: Activation,
        dropout: f32,
    ) -> Result<Self> {
        let norm = candle_nn::layer_norm(dim, 1e-5, vb.pp("0"))?;
        let w_1 = candle_nn::linear(dim, hidden, vb.pp("1.ffn.0"))?;
        let w_2 = candle_nn::linear(hidden, dim, vb.pp("1.ffn.3"))?;
        Ok(Self {
            norm,
            w_1,
            w_2,
            activation,
            dropout: candle_nn::Dropout::new(dropout),
        })
    }

    /// `[B, T, dim]` → `[B, T, dim]`.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.norm.forward(x)?;
        let x = self.w_1.forward(&x)?;
        let x = x.apply(&self.activation)?;
        let x = self.dropout.forward(&x, train)?;
        let x = self.w_2.forward(&x)?;
        Ok(self.dropout.forward(&x, train)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn ffn_output_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let ffn = FeedForwardModule::load(vb, 64, 256, Activation::Swish, 0.0).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (2, 16, 64), &device).unwrap();
        let out = ffn.forward(&x, false).unwrap();
        assert_eq!(out.dims(), &[2, 16, 64]);
    }

    #[test]
    fn weights_follow_key_paths() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _ffn =
            FeedForwardModule::load(vb.pp("ffn_module1"), 8, 32, Activation::Relu, 0.1).unwrap();

        let data = varmap.data().lock().unwrap();
        for key in [
            "ffn_module1.0.weight",
            "ffn_module1.1.ffn.0.weight",
            "ffn_module1.1.ffn.3.bias",
        ] {
            assert!(data.contains_key(key), "missing {key}");
        }
    }
}
