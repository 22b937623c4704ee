//! Conformer decoder.
//!
//! Same macaron skeleton as the encoder, but the attention stage attends an
//! external memory (the encoder output) instead of the running sequence:
//!
//! ```text
//! N × ConformerDecoderLayer:
//!   1. x = x + ½ · FFN₁(x)
//!   2. x = x + MHA(q = norm1(x), k = v = memory, pos_embs_src, memory masks)
//!   3. x = x + ConvModule(x)                    (causal by default)
//!   4. x = norm2(x + ½ · FFN₂(x))
//!
//! norm: LayerNorm(d_model, eps = 1e-6)
//! ```
//!
//! No target self-attention is computed; the cross-attention weights fill
//! both returned attention slots.
//!
//! Weight key paths match the encoder (`layers.{i}.*`, `norm.norm.*`).

use std::fmt;

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use crate::config::{AttentionType, ConformerConfig};
use crate::model::attention::{require_pos_embs, Attention, AttentionMasks};
use crate::model::convolution::ConvolutionModule;
use crate::model::encoder::FFN_HALF_STEP;
use crate::model::feed_forward::FeedForwardModule;
use crate::Result;

/// Non-fatal advisory produced while building a decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// The decoder layer at this index was built with non-causal convolution,
    /// so target frames can depend on later frames.
    NonCausalDecoder { layer: usize },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonCausalDecoder { layer } => write!(
                f,
                "decoder layer {layer} is not causal: target frames can see future frames"
            ),
        }
    }
}

/// Per-call inputs shared by every decoder layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderInputs<'a> {
    /// `[T, S]` or `[B, T, S]` mask over memory frames.
    pub memory_mask: Option<&'a Tensor>,
    /// `[B, S]`, nonzero marks padded memory frames.
    pub memory_key_padding_mask: Option<&'a Tensor>,
    /// `[1, 2S-1, d_model]` relative positional embeddings of the memory.
    pub pos_embs_src: Option<&'a Tensor>,
    /// Training mode (enables dropout).
    pub train: bool,
}

// ---------------------------------------------------------------------------
// Decoder layer
// ---------------------------------------------------------------------------

pub struct ConformerDecoderLayer {
    ffn_module1: FeedForwardModule,
    mha_layer: Attention,
    convolution_module: ConvolutionModule,
    ffn_module2: FeedForwardModule,
    norm1: candle_nn::LayerNorm,
    norm2: candle_nn::LayerNorm,
}

impl ConformerDecoderLayer {
    /// Build one decoder layer. A non-causal config yields a
    /// [`Diagnostic::NonCausalDecoder`] for `index`.
    pub fn load(
        vb: VarBuilder,
        config: &ConformerConfig,
        index: usize,
    ) -> Result<(Self, Option<Diagnostic>)> {
        config.validate()?;
        let dim = config.d_model;

        let diagnostic = (!config.causal).then_some(Diagnostic::NonCausalDecoder { layer: index });

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

        Ok((
            Self {
                ffn_module1,
                mha_layer,
                convolution_module,
                ffn_module2,
                norm1,
                norm2,
            },
            diagnostic,
        ))
    }

    pub fn attention_type(&self) -> AttentionType {
        self.mha_layer.attention_type()
    }

    /// Forward pass.
    ///
    /// - `tgt`: `[B, T, d_model]`
    /// - `memory`: `[B, S, d_model]`
    ///
    /// Returns `(x [B, T, d_model], self_attn, cross_attn)`; both weight
    /// tensors are the cross-attention weights `[B, H, T, S]`.
    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        inputs: DecoderInputs<'_>,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        require_pos_embs(self.attention_type(), inputs.pos_embs_src)?;

        let ff = self.ffn_module1.forward(tgt, inputs.train)?;
        let skip = (tgt + (ff * FFN_HALF_STEP)?)?;

        let x = self.norm1.forward(&skip)?;
        let masks = AttentionMasks {
            attn_mask: inputs.memory_mask,
            key_padding_mask: inputs.memory_key_padding_mask,
        };
        let (x, attn) =
            self.mha_layer
                .forward(&x, memory, memory, masks, inputs.pos_embs_src, inputs.train)?;
        let x = (x + skip)?;

        let conv = self
            .convolution_module
            .forward(&x, None, None, inputs.train)?;
        let x = (x + conv)?;

        let ff = self.ffn_module2.forward(&x, inputs.train)?;
        let x = self.norm2.forward(&(x + (ff * FFN_HALF_STEP)?)?)?;

        Ok((x, attn.clone(), attn))
    }
}

// ---------------------------------------------------------------------------
// Decoder (stack)
// ---------------------------------------------------------------------------

/// Conformer decoder: N layers + final LayerNorm.
pub struct ConformerDecoder {
    layers: Vec<ConformerDecoderLayer>,
    norm: candle_nn::LayerNorm,
    config: ConformerConfig,
}

impl ConformerDecoder {
    /// Build the stack, returning the diagnostics of every layer.
    pub fn load(vb: VarBuilder, config: &ConformerConfig) -> Result<(Self, Vec<Diagnostic>)> {
        config.validate()?;
        tracing::debug!(
            "building conformer decoder: {} layers, d_model={}, nhead={}, kernel={}, causal={}, attention={}",
            config.num_layers,
            config.d_model,
            config.nhead,
            config.kernel_size,
            config.causal,
            config.attention_type
        );

        let mut layers = Vec::with_capacity(config.num_layers);
        let mut diagnostics = Vec::new();
        for i in 0..config.num_layers {
            let (layer, diagnostic) =
                ConformerDecoderLayer::load(vb.pp(format!("layers.{i}")), config, i)?;
            layers.push(layer);
            diagnostics.extend(diagnostic);
        }
        let norm = candle_nn::layer_norm(config.d_model, 1e-6, vb.pp("norm.norm"))?;

        Ok((
            Self {
                layers,
                norm,
                config: config.clone(),
            },
            diagnostics,
        ))
    }

    pub fn config(&self) -> &ConformerConfig {
        &self.config
    }

    pub fn layers(&self) -> &[ConformerDecoderLayer] {
        &self.layers
    }

    /// Forward pass.
    ///
    /// - `tgt`: `[B, T, d_model]`
    /// - `memory`: `[B, S, d_model]`
    ///
    /// Returns `(normalised output, self-attention weights, cross-attention weights)`,
    /// one weight tensor per layer in each list.
    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        inputs: DecoderInputs<'_>,
    ) -> Result<(Tensor, Vec<Tensor>, Vec<Tensor>)> {
        require_pos_embs(self.config.attention_type, inputs.pos_embs_src)?;

        let mut output = tgt.clone();
        let mut self_attns = Vec::with_capacity(self.layers.len());
        let mut multihead_attns = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (out, self_attn, multihead_attn) = layer.forward(&output, memory, inputs)?;
            output = out;
            self_attns.push(self_attn);
            multihead_attns.push(multihead_attn);
        }

        let output = self.norm.forward(&output)?;
        Ok((output, self_attns, multihead_attns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mask;
    use crate::Error;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn decoder_shapes_with_longer_memory() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let config = ConformerConfig::decoder(2, 16, 32, 4);
        let (decoder, diagnostics) = ConformerDecoder::load(vb, &config).unwrap();
        assert!(diagnostics.is_empty());

        let tgt = Tensor::randn(0.0_f32, 1.0, (2, 6, 16), &device).unwrap();
        let memory = Tensor::randn(0.0_f32, 1.0, (2, 11, 16), &device).unwrap();
        let pe = Tensor::randn(0.0_f32, 1.0, (1, 21, 16), &device).unwrap();

        let (out, self_attns, cross_attns) = decoder
            .forward(
                &tgt,
                &memory,
                DecoderInputs {
                    pos_embs_src: Some(&pe),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(out.dims(), &[2, 6, 16]);
        assert_eq!(self_attns.len(), 2);
        assert_eq!(cross_attns.len(), 2);
        for (s, c) in self_attns.iter().zip(&cross_attns) {
            assert_eq!(c.dims(), &[2, 4, 6, 11]);
            assert_eq!(to_vec(s), to_vec(c));
        }
    }

    #[test]
    fn layer_returns_cross_attention_twice() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let config = ConformerConfig {
            attention_type: AttentionType::RegularMha,
            ..ConformerConfig::decoder(1, 16, 32, 2)
        };
        let (layer, diagnostic) = ConformerDecoderLayer::load(vb, &config, 0).unwrap();
        assert!(diagnostic.is_none());

        let tgt = Tensor::randn(0.0_f32, 1.0, (1, 4, 16), &device).unwrap();
        let memory = Tensor::randn(0.0_f32, 1.0, (1, 7, 16), &device).unwrap();
        let padding = mask::padding_mask_from_lengths(&[5], 7, &device).unwrap();

        let (out, self_attn, cross_attn) = layer
            .forward(
                &tgt,
                &memory,
                DecoderInputs {
                    memory_key_padding_mask: Some(&padding),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(out.dims(), &[1, 4, 16]);
        assert_eq!(to_vec(&self_attn), to_vec(&cross_attn));

        // Padded memory frames receive no weight.
        let padded: f32 = cross_attn
            .narrow(3, 5, 2)
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(padded < 1e-6);
    }

    #[test]
    fn non_causal_decoder_reports_every_layer() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let config = ConformerConfig {
            causal: false,
            ..ConformerConfig::decoder(3, 16, 32, 4)
        };
        let (_decoder, diagnostics) = ConformerDecoder::load(vb, &config).unwrap();
        assert_eq!(
            diagnostics,
            vec![
                Diagnostic::NonCausalDecoder { layer: 0 },
                Diagnostic::NonCausalDecoder { layer: 1 },
                Diagnostic::NonCausalDecoder { layer: 2 },
            ]
        );
        assert!(diagnostics[1].to_string().contains("layer 1"));
    }

    #[test]
    fn decoder_rejects_missing_pos_embs_before_computing() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let (decoder, _) =
            ConformerDecoder::load(vb, &ConformerConfig::decoder(1, 16, 32, 4)).unwrap();

        let tgt = Tensor::randn(0.0_f32, 1.0, (1, 3, 5), &device).unwrap();
        let memory = Tensor::randn(0.0_f32, 1.0, (1, 4, 9), &device).unwrap();
        let err = decoder
            .forward(&tgt, &memory, DecoderInputs::default())
            .unwrap_err();
        assert!(matches!(err, Error::MissingPositionalEmbeddings { .. }));
    }
}
