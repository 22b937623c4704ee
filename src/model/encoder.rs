//! Conformer encoder.
//!
//! ## Architecture
//!
//! ```text
//! N × ConformerEncoderLayer (macaron):
//!   1. x = x + ½ · FFN₁(x)                      (FFN is pre-normalised)
//!   2. x = x + MHA(norm1(x), pos_embs, masks)
//!   3. x = x + ConvModule(x, padding mask, chunk_size)
//!   4. x = norm2(x + ½ · FFN₂(x))
//!
//! norm: LayerNorm(d_model, eps = 1e-6)
//! ```
//!
//! Every layer receives the same masks, positional embeddings and chunk size;
//! only the sequence tensor flows from one layer to the next.
//!
//! ## Weight key paths
//!
//! ```text
//! layers.{i}.ffn_module1.*          — see feed_forward
//! layers.{i}.mha_layer.*            — see attention
//! layers.{i}.convolution_module.*   — see convolution
//! layers.{i}.ffn_module2.*
//! layers.{i}.norm1.norm.{weight,bias}
//! layers.{i}.norm2.norm.{weight,bias}
//! norm.norm.{weight,bias}
//! ```

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use crate::config::{AttentionType, ConformerConfig};
use crate::model::attention::{require_pos_embs, Attention, AttentionMasks};
use crate::model::convolution::ConvolutionModule;
use crate::model::feed_forward::FeedForwardModule;
use crate::model::mask;
use crate::model::probe::{observe, Probe};
use crate::Result;

/// Residual weight of each macaron feed-forward branch.
pub const FFN_HALF_STEP: f64 = 0.5;

/// Per-call inputs shared by every encoder layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderInputs<'a> {
    /// `[T, T]` or `[B, T, T]` attention mask.
    pub src_mask: Option<&'a Tensor>,
    /// `[B, T]`, nonzero marks padded frames.
    pub src_key_padding_mask: Option<&'a Tensor>,
    /// `[1, 2T-1, d_model]` relative positional embeddings.
    pub pos_embs: Option<&'a Tensor>,
    /// Dynamic chunk size for the convolution modules.
    pub chunk_size: Option<usize>,
    /// Training mode (enables dropout).
    pub train: bool,
}

// ---------------------------------------------------------------------------
// Encoder layer
// ---------------------------------------------------------------------------

/// One Conformer block.
pub struct ConformerEncoderLayer {
    ffn_module1: FeedForwardModule,
    mha_layer: Attention,
    convolution_module: ConvolutionModule,
    ffn_module2: FeedForwardModule,
    norm1: candle_nn::LayerNorm,
    norm2: candle_nn::LayerNorm,
    probe: Option<Probe>,
}

impl ConformerEncoderLayer {
    pub fn load(vb: VarBuilder, config: &ConformerConfig) -> Result<Self> {
        config.validate()?;
        let dim = config.d_model;

        let ffn_module1 = FeedForwardModule::load(
            vb.pp("ffn_module1"),
            dim,
            config.d_ffn,
            config.activation,
            config.dropout,
        )?;
        let mha_layer = Attention::load(vb.pp("mha_layer"), config)?;
        let convolution_module =
            ConvolutionModule::load(vb.pp("convolution_module"), &config.convolution())?;
        let ffn_module2 = FeedForwardModule::load(
            vb.pp("ffn_module2"),
            dim,
            config.d_ffn,
            config.activation,
            config.dropout,
        )?;
        let norm1 = candle_nn::layer_norm(dim, 1e-5, vb.pp("norm1.norm"))?;
        let norm2 = candle_nn::layer_norm(dim, 1e-5, vb.pp("norm2.norm"))?;

        Ok(Self {
            ffn_module1,
            mha_layer,
            convolution_module,
            ffn_module2,
            norm1,
            norm2,
            probe: None,
        })
    }

    /// Install a numeric-health probe.
    pub fn with_probe(mut self, probe: Probe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn attention_type(&self) -> AttentionType {
        self.mha_layer.attention_type()
    }

    pub fn convolution_module(&self) -> &ConvolutionModule {
        &self.convolution_module
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, T, d_model]`
    ///
    /// Returns `(x [B, T, d_model], self-attention weights [B, H, T, T])`.
    pub fn forward(&self, x: &Tensor, inputs: EncoderInputs<'_>) -> Result<(Tensor, Tensor)> {
        require_pos_embs(self.attention_type(), inputs.pos_embs)?;

        let conv_mask = inputs
            .src_key_padding_mask
            .map(mask::conv_mask)
            .transpose()?;
        let probe = self.probe.as_ref();

        // 1. First half-step feed-forward
        observe(probe, x, "pre ffn");
        let ff = self.ffn_module1.forward(x, inputs.train)?;
        let x = (x + (ff * FFN_HALF_STEP)?)?;

        // 2. Self-attention on the normalised sequence, residual from before the norm
        let skip = x;
        observe(probe, &skip, "pre norm");
        let x = self.norm1.forward(&skip)?;
        observe(probe, &x, "pre mha");
        let masks = AttentionMasks {
            attn_mask: inputs.src_mask,
            key_padding_mask: inputs.src_key_padding_mask,
        };
        let (x, self_attn) =
            self.mha_layer
                .forward(&x, &x, &x, masks, inputs.pos_embs, inputs.train)?;
        observe(probe, &x, "pre skip");
        let x = (x + skip)?;

        // 3. Convolution module
        observe(probe, &x, "pre conv");
        let conv = self.convolution_module.forward(
            &x,
            conv_mask.as_ref(),
            inputs.chunk_size,
            inputs.train,
        )?;
        let x = (x + conv)?;

        // 4. Second half-step feed-forward, normalised together with its residual
        observe(probe, &x, "pre norm2");
        let ff = self.ffn_module2.forward(&x, inputs.train)?;
        let x = self.norm2.forward(&(x + (ff * FFN_HALF_STEP)?)?)?;

        Ok((x, self_attn))
    }
}

// ---------------------------------------------------------------------------
// Encoder (stack)
// ---------------------------------------------------------------------------

/// Conformer encoder: N layers + final LayerNorm.
pub struct ConformerEncoder {
    layers: Vec<ConformerEncoderLayer>,
    norm: candle_nn::LayerNorm,
    probe: Option<Probe>,
    config: ConformerConfig,
}

impl ConformerEncoder {
    pub fn load(vb: VarBuilder, config: &ConformerConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            "building conformer encoder: {} layers, d_model={}, nhead={}, kernel={}, causal={}, attention={}",
            config.num_layers,
            config.d_model,
            config.nhead,
            config.kernel_size,
            config.causal,
            config.attention_type
        );

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(ConformerEncoderLayer::load(
                vb.pp(format!("layers.{i}")),
                config,
            )?);
        }
        let norm = candle_nn::layer_norm(config.d_model, 1e-6, vb.pp("norm.norm"))?;

        Ok(Self {
            layers,
            norm,
            probe: None,
            config: config.clone(),
        })
    }

    /// Install a numeric-health probe on the stack and every layer.
    pub fn with_probe(mut self, probe: Probe) -> Self {
        self.layers = self
            .layers
            .into_iter()
            .map(|layer| layer.with_probe(probe.clone()))
            .collect();
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &ConformerConfig {
        &self.config
    }

    pub fn layers(&self) -> &[ConformerEncoderLayer] {
        &self.layers
    }

    /// Forward pass.
    ///
    /// - `src`: `[B, T, d_model]`
    ///
    /// Returns `(normalised output [B, T, d_model], per-layer attention weights)`.
    pub fn forward(
        &self,
        src: &Tensor,
        inputs: EncoderInputs<'_>,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        require_pos_embs(self.config.attention_type, inputs.pos_embs)?;

        observe(self.probe.as_ref(), src, "src in whole enc");
        let mut output = src.clone();
        let mut attention_lst = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let (out, attention) = layer.forward(&output, inputs)?;
            if let Some(probe) = &self.probe {
                probe(&out, &format!("post layer # {i}"));
            }
            output = out;
            attention_lst.push(attention);
        }

        let output = self.norm.forward(&output)?;
        Ok((output, attention_lst))
    }
}
