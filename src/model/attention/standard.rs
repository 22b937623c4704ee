//! Regular scaled dot-product multi-head attention.
//!
//! Query comes from the running sequence, key/value from the same sequence
//! (self-attention) or an external memory (cross-attention). Key and value
//! inputs may have their own widths (`kdim`, `vdim`).
//!
//! ## Weight key paths (under `att.`)
//!
//! ```text
//! in_proj_weight (3E, E)                 — packed q/k/v, when kdim = vdim = E
//! q_proj_weight (E, E), k_proj_weight (E, kdim), v_proj_weight (E, vdim)
//!                                        — otherwise
//! in_proj_bias (3E)
//! out_proj.{weight,bias}
//! ```

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::AttentionMasks;
use crate::config;
use crate::Result;

pub struct StandardAttention {
    to_q: candle_nn::Linear,
    to_k: candle_nn::Linear,
    to_v: candle_nn::Linear,
    to_out: candle_nn::Linear,
    num_heads: usize,
    head_dim: usize,
    dropout: candle_nn::Dropout,
}

impl StandardAttention {
    pub fn load(
        vb: VarBuilder,
        d_model: usize,
        num_heads: usize,
        kdim: Option<usize>,
        vdim: Option<usize>,
        dropout: f32,
    ) -> Result<Self> {
        let head_dim = config::head_dim(d_model, num_heads)?;
        let vb = vb.pp("att");
        let kdim = kdim.unwrap_or(d_model);
        let vdim = vdim.unwrap_or(d_model);
        let init = candle_nn::init::DEFAULT_KAIMING_NORMAL;

        let (w_q, w_k, w_v) = if kdim == d_model && vdim == d_model {
            let packed = vb.get_with_hints((3 * d_model, d_model), "in_proj_weight", init)?;
            (
                packed.narrow(0, 0, d_model)?,
                packed.narrow(0, d_model, d_model)?,
                packed.narrow(0, 2 * d_model, d_model)?,
            )
        } else {
            (
                vb.get_with_hints((d_model, d_model), "q_proj_weight", init)?,
                vb.get_with_hints((d_model, kdim), "k_proj_weight", init)?,
                vb.get_with_hints((d_model, vdim), "v_proj_weight", init)?,
            )
        };
        let bias = vb.get(3 * d_model, "in_proj_bias")?;

        let to_q = candle_nn::Linear::new(w_q, Some(bias.narrow(0, 0, d_model)?));
        let to_k = candle_nn::Linear::new(w_k, Some(bias.narrow(0, d_model, d_model)?));
        let to_v = candle_nn::Linear::new(w_v, Some(bias.narrow(0, 2 * d_model, d_model)?));
        let to_out = candle_nn::linear(d_model, d_model, vb.pp("out_proj"))?;

        Ok(Self {
            to_q,
            to_k,
            to_v,
            to_out,
            num_heads,
            head_dim,
            dropout: candle_nn::Dropout::new(dropout),
        })
    }

    /// Forward pass.
    ///
    /// - `query`: `[B, T, d_model]`
    /// - `key`: `[B, S, kdim]`, `value`: `[B, S, vdim]`
    ///
    /// Returns `([B, T, d_model], [B, H, T, S])`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        masks: AttentionMasks<'_>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, seq_q, _) = query.dims3()?;
        let seq_k = key.dim(1)?;

        let q = self.to_q.forward(query)?;
        let k = self.to_k.forward(key)?;
        let v = self.to_v.forward(value)?;

        // [B, S, H*D] → [B, H, S, D]
        let q = q
            .reshape((batch, seq_q, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch, seq_k, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch, seq_k, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / scale)?;
        let scores = masks.apply(scores)?;

        let attn = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = self.dropout.forward(&attn, train)?.matmul(&v)?; // [B, H, T, D]

        let out = out
            .transpose(1, 2)?
            .reshape((batch, seq_q, self.num_heads * self.head_dim))?;
        let out = self.to_out.forward(&out)?;
        Ok((out, attn))
    }
}
