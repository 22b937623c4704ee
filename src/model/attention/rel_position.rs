//! Relative-position multi-head attention (Transformer-XL style).
//!
//! Attention scores:
//! ```text
//! matrix_ac = (Q + pos_bias_u) · K^T     (content-to-content)
//! matrix_bd = (Q + pos_bias_v) · P^T     (content-to-position)
//! scores = (matrix_ac + rel_shift(matrix_bd)) / √d_k
//! ```
//!
//! `P` is the projected positional embedding `[1, 2S-1, d_model]`, ordered
//! from the largest positive relative position to the largest negative one.
//!
//! ## Weight key paths
//!
//! ```text
//! linear_q / linear_k / linear_v / linear_out.{weight,bias}
//! linear_pos.weight      (no bias)
//! pos_bias_u, pos_bias_v (H, d_k)
//! ```

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::AttentionMasks;
use crate::config;
use crate::model::mask;
use crate::Result;

/// Multi-headed attention with learnable relative-position biases.
pub struct RelPositionAttention {
    num_heads: usize,
    head_dim: usize,
    linear_q: candle_nn::Linear,
    linear_k: candle_nn::Linear,
    linear_v: candle_nn::Linear,
    linear_out: candle_nn::Linear,
    linear_pos: candle_nn::Linear,
    pos_bias_u: Tensor,
    pos_bias_v: Tensor,
    dropout: candle_nn::Dropout,
    /// Zero the positional term for keys after the query (causal layers).
    mask_pos_future: bool,
}

impl RelPositionAttention {
    pub fn load(
        vb: VarBuilder,
        n_feat: usize,
        n_head: usize,
        dropout: f32,
        mask_pos_future: bool,
    ) -> Result<Self> {
        let d_k = config::head_dim(n_feat, n_head)?;

        let linear_q = candle_nn::linear(n_feat, n_feat, vb.pp("linear_q"))?;
        let linear_k = candle_nn::linear(n_feat, n_feat, vb.pp("linear_k"))?;
        let linear_v = candle_nn::linear(n_feat, n_feat, vb.pp("linear_v"))?;
        let linear_out = candle_nn::linear(n_feat, n_feat, vb.pp("linear_out"))?;
        let linear_pos = candle_nn::linear_no_bias(n_feat, n_feat, vb.pp("linear_pos"))?;
        let pos_bias_u =
            vb.get_with_hints((n_head, d_k), "pos_bias_u", candle_nn::init::DEFAULT_KAIMING_NORMAL)?;
        let pos_bias_v =
            vb.get_with_hints((n_head, d_k), "pos_bias_v", candle_nn::init::DEFAULT_KAIMING_NORMAL)?;

        Ok(Self {
            num_heads: n_head,
            head_dim: d_k,
            linear_q,
            linear_k,
            linear_v,
            linear_out,
            linear_pos,
            pos_bias_u,
            pos_bias_v,
            dropout: candle_nn::Dropout::new(dropout),
            mask_pos_future,
        })
    }

    /// Relative shift (skew trick) for matrix_bd.
    ///
    /// Input: `[B, H, T, P]` → Output: `[B, H, T, P/2 + 1]`
    ///
    /// Pads a zero column, reshapes, slices to extract proper relative positions.
    /// With `mask_pos_future`, entries with `j > i + (P - T)` are zeroed before
    /// the slice.
    fn rel_shift(x: &Tensor, mask_pos_future: bool) -> Result<Tensor> {
        let (b, h, t1, t2) = x.dims4()?;

        let zero_pad = Tensor::zeros((b, h, t1, 1), x.dtype(), x.device())?;
        let x_padded = Tensor::cat(&[&zero_pad, x], 3)?; // [B, H, T, P+1]

        // [B, H, P+1, T], skip first row, view back as [B, H, T, P]
        let x_padded = x_padded.reshape((b, h, t2 + 1, t1))?;
        let x = x_padded.narrow(2, 1, t2)?.reshape((b, h, t1, t2))?;

        let x = if mask_pos_future {
            let keep = mask::tril_ones(t1, t2, t2 as isize - t1 as isize, x.dtype(), x.device())?;
            x.broadcast_mul(&keep)?
        } else {
            x
        };

        Ok(x.narrow(3, 0, t2 / 2 + 1)?)
    }

    fn split_heads(&self, x: &Tensor, batch: usize, len: usize) -> Result<Tensor> {
        Ok(x
            .reshape((batch, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Forward pass.
    ///
    /// - `query`: `[B, T, n_feat]`; `key`, `value`: `[B, S, n_feat]`
    /// - `pos_emb`: `[1, 2S-1, n_feat]`
    ///
    /// Returns `([B, T, n_feat], [B, H, T, S])`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        pos_emb: &Tensor,
        masks: AttentionMasks<'_>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, time1, _) = query.dims3()?;
        let time2 = key.dim(1)?;
        let h = self.num_heads;
        let d_k = self.head_dim;

        let q = self.split_heads(&self.linear_q.forward(query)?, batch, time1)?;
        let k = self.split_heads(&self.linear_k.forward(key)?, batch, time2)?;
        let v = self.split_heads(&self.linear_v.forward(value)?, batch, time2)?;

        // pos_bias: [H, d_k] → [1, H, 1, d_k]
        let bias_u = self.pos_bias_u.unsqueeze(0)?.unsqueeze(2)?;
        let q_with_bias_u = q.broadcast_add(&bias_u)?;
        let bias_v = self.pos_bias_v.unsqueeze(0)?.unsqueeze(2)?;
        let q_with_bias_v = q.broadcast_add(&bias_v)?;

        // [1, P, n_feat] → [1, H, P, d_k]
        let p_len = pos_emb.dim(1)?;
        let p = self
            .linear_pos
            .forward(pos_emb)?
            .reshape((1, p_len, h, d_k))?
            .transpose(1, 2)?
            .contiguous()?;

        // [B, H, T, S]
        let matrix_ac = q_with_bias_u.broadcast_matmul(&k.transpose(2, 3)?.contiguous()?)?;
        // [B, H, T, P], P broadcast over the batch
        let matrix_bd = q_with_bias_v.broadcast_matmul(&p.transpose(2, 3)?.contiguous()?)?;

        let matrix_bd = Self::rel_shift(&matrix_bd, self.mask_pos_future)?;

        let scale = (d_k as f64).sqrt();
        let scores = ((matrix_ac + matrix_bd)? / scale)?;
        let scores = masks.apply(scores)?;

        let attn = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = self.dropout.forward(&attn, train)?.matmul(&v)?; // [B, H, T, d_k]

        let out = out.transpose(1, 2)?.reshape((batch, time1, h * d_k))?;
        let out = self.linear_out.forward(&out)?;
        Ok((out, attn))
    }
}
