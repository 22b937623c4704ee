//! Attention collaborators used by the Conformer layers.
//!
//! - [`RelPositionAttention`] — Transformer-XL relative-position attention
//! - [`StandardAttention`] — regular scaled dot-product attention
//!
//! Both are reached through [`Attention`], picked once from
//! [`AttentionType`] at construction, and share one call contract:
//! `(query, key, value, masks, pos_embs, train) → (output, weights)` with
//! `weights: [B, H, T, S]`.

pub mod rel_position;
pub mod standard;

pub use rel_position::RelPositionAttention;
pub use standard::StandardAttention;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::config::{AttentionType, ConformerConfig};
use crate::model::mask;
use crate::{Error, Result};

/// Masks restricting which keys each query may attend to.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttentionMasks<'a> {
    /// `[T, S]` or `[B, T, S]`; boolean (nonzero = blocked) or additive float.
    pub attn_mask: Option<&'a Tensor>,
    /// `[B, S]`; nonzero marks padded keys.
    pub key_padding_mask: Option<&'a Tensor>,
}

impl AttentionMasks<'_> {
    /// Add both masks to `scores: [B, H, T, S]`.
    pub(crate) fn apply(&self, scores: Tensor) -> Result<Tensor> {
        let mut scores = scores;
        if let Some(attn_mask) = self.attn_mask {
            let bias = mask::additive_mask(attn_mask, scores.dtype())?;
            let bias = match bias.rank() {
                2 => bias.unsqueeze(0)?.unsqueeze(0)?, // [1, 1, T, S]
                3 => bias.unsqueeze(1)?,               // [B, 1, T, S]
                _ => bias,
            };
            scores = scores.broadcast_add(&bias)?;
        }
        if let Some(key_padding_mask) = self.key_padding_mask {
            // [B, S] → [B, 1, 1, S]
            let bias = mask::additive_mask(key_padding_mask, scores.dtype())?
                .unsqueeze(1)?
                .unsqueeze(1)?;
            scores = scores.broadcast_add(&bias)?;
        }
        Ok(scores)
    }
}

/// Fail with a configuration error when `attention` needs positional embeddings
/// and none were supplied.
pub fn require_pos_embs(attention: AttentionType, pos_embs: Option<&Tensor>) -> Result<()> {
    if attention.requires_pos_embs() && pos_embs.is_none() {
        return Err(Error::MissingPositionalEmbeddings { attention });
    }
    Ok(())
}

/// The attention variant of a layer.
pub enum Attention {
    RelPositionXl(RelPositionAttention),
    Standard(StandardAttention),
}

impl Attention {
    /// Build the variant named by `config.attention_type`.
    ///
    /// Relative-position attention masks future positional terms when
    /// `config.causal` is set.
    pub fn load(vb: VarBuilder, config: &ConformerConfig) -> Result<Self> {
        match config.attention_type {
            AttentionType::RelPosMhaXl => Ok(Self::RelPositionXl(RelPositionAttention::load(
                vb,
                config.d_model,
                config.nhead,
                config.dropout,
                config.causal,
            )?)),
            AttentionType::RegularMha => Ok(Self::Standard(StandardAttention::load(
                vb,
                config.d_model,
                config.nhead,
                config.kdim,
                config.vdim,
                config.dropout,
            )?)),
        }
    }

    pub fn attention_type(&self) -> AttentionType {
        match self {
            Self::RelPositionXl(_) => AttentionType::RelPosMhaXl,
            Self::Standard(_) => AttentionType::RegularMha,
        }
    }

    /// Forward pass.
    ///
    /// - `query`: `[B, T, d_model]`
    /// - `key`, `value`: `[B, S, *]`
    /// - `pos_embs`: `[1, 2S-1, d_model]`, required by the relative-position variant
    ///
    /// Returns `(output [B, T, d_model], weights [B, H, T, S])`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        masks: AttentionMasks<'_>,
        pos_embs: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        match self {
            Self::RelPositionXl(attn) => {
                let pos_embs = pos_embs.ok_or(Error::MissingPositionalEmbeddings {
                    attention: AttentionType::RelPosMhaXl,
                })?;
                attn.forward(query, key, value, pos_embs, masks, train)
            }
            Self::Standard(attn) => attn.forward(query, key, value, masks, train),
        }
    }
}
