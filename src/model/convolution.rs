//! Conformer convolution module with dynamic chunk support.
//!
//! ```text
//! x [B, T, C]
//!   → LayerNorm
//!   → transpose → [B, C, T]
//!   → 1×1 conv (C → 2C) → GLU (→ C)              "bottleneck"
//!   → depthwise conv (groups = C, kernel k, dilation d)
//!   → [causal only] drop the trailing `padding` frames
//!   → transpose → [B, T, C]
//!   → LayerNorm → activation → Linear(C, C) → Dropout
//!   → [mask] zero padded frames
//! ```
//!
//! ## Dynamic chunk convolution
//!
//! With a `chunk_size`, the time axis is cut into `ceil(T / chunk_size)`
//! windows. Chunk `i` carries `min(padding, i * chunk_size)` real frames of
//! left context, is zero-padded on the left up to `padding` and on the right
//! by exactly `padding` frames, and then runs through the module body with an
//! unpadded depthwise convolution. Each window yields exactly its own chunk's
//! frames, so concatenating the outputs restores `[B, T, C]` while no frame
//! sees past the end of its chunk.
//!
//! ## Weight key paths
//!
//! ```text
//! layer_norm.{weight,bias}
//! bottleneck.0.{weight,bias}    — Conv1d(C, 2C, 1)
//! conv.{weight,bias}            — Conv1d(C, C, k, groups=C)
//! after_conv.0.{weight,bias}    — LayerNorm(C)
//! after_conv.2.{weight,bias}    — Linear(C, C)
//! ```

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use crate::config::ConvolutionModuleConfig;
use crate::{Error, Result};

/// How the depthwise convolution gets its padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConvBranch {
    /// Whole sequence: the convolution pads inline, causal modules chomp afterwards.
    FullSequence,
    /// Pre-padded chunk window: no inline padding and no chomp.
    ChunkWindow,
}

/// Gated linear unit over `dim`: first half gated by the sigmoid of the second.
fn glu(x: &Tensor, dim: usize) -> Result<Tensor> {
    let chunks = x.chunk(2, dim)?;
    let gate = candle_nn::ops::sigmoid(&chunks[1])?;
    Ok((&chunks[0] * gate)?)
}

/// Convolution module of a Conformer layer.
#[derive(Debug, Clone)]
pub struct ConvolutionModule {
    config: ConvolutionModuleConfig,
    padding: usize,
    layer_norm: candle_nn::LayerNorm,
    /// 1×1 pointwise expansion C → 2C, gated back to C.
    bottleneck: candle_nn::Conv1d,
    /// Depthwise conv padded by `padding` on both sides.
    conv: candle_nn::Conv1d,
    /// Same weights as `conv`, without padding.
    conv_unpadded: candle_nn::Conv1d,
    after_norm: candle_nn::LayerNorm,
    after_linear: candle_nn::Linear,
    dropout: candle_nn::Dropout,
}

impl ConvolutionModule {
    pub fn load(vb: VarBuilder, config: &ConvolutionModuleConfig) -> Result<Self> {
        config.validate()?;
        let channels = config.input_size;
        let padding = config.padding();

        let layer_norm = candle_nn::layer_norm(channels, 1e-5, vb.pp("layer_norm"))?;

        let pointwise_cfg = candle_nn::Conv1dConfig {
            padding: 0,
            stride: 1,
            dilation: 1,
            groups: 1,
            ..Default::default()
        };
        let depthwise_cfg = candle_nn::Conv1dConfig {
            padding,
            stride: 1,
            dilation: config.dilation,
            groups: channels,
            ..Default::default()
        };

        let (bottleneck, conv) = if config.bias {
            (
                candle_nn::conv1d(
                    channels,
                    2 * channels,
                    1,
                    pointwise_cfg,
                    vb.pp("bottleneck.0"),
                )?,
                candle_nn::conv1d(
                    channels,
                    channels,
                    config.kernel_size,
                    depthwise_cfg,
                    vb.pp("conv"),
                )?,
            )
        } else {
            (
                candle_nn::conv1d_no_bias(
                    channels,
                    2 * channels,
                    1,
                    pointwise_cfg,
                    vb.pp("bottleneck.0"),
                )?,
                candle_nn::conv1d_no_bias(
                    channels,
                    channels,
                    config.kernel_size,
                    depthwise_cfg,
                    vb.pp("conv"),
                )?,
            )
        };

        let unpadded_cfg = candle_nn::Conv1dConfig {
            padding: 0,
            stride: 1,
            dilation: config.dilation,
            groups: channels,
            ..Default::default()
        };
        let conv_unpadded =
            candle_nn::Conv1d::new(conv.weight().clone(), conv.bias().cloned(), unpadded_cfg);

        let after_norm = candle_nn::layer_norm(channels, 1e-5, vb.pp("after_conv.0"))?;
        let after_linear =
            candle_nn::linear_b(channels, channels, config.bias, vb.pp("after_conv.2"))?;

        Ok(Self {
            config: config.clone(),
            padding,
            layer_norm,
            bottleneck,
            conv,
            conv_unpadded,
            after_norm,
            after_linear,
            dropout: candle_nn::Dropout::new(config.dropout),
        })
    }

    pub fn config(&self) -> &ConvolutionModuleConfig {
        &self.config
    }

    /// Padding of the depthwise convolution; also the chunk left context.
    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn is_causal(&self) -> bool {
        self.config.causal
    }

    /// Forward pass.
    ///
    /// - `x`: `[B, T, C]`
    /// - `mask`: `[B, T, 1]`, nonzero frames are zeroed in the output
    /// - `chunk_size`: run dynamic chunk convolution (non-causal modules only)
    ///
    /// Returns `[B, T, C]`.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        chunk_size: Option<usize>,
        train: bool,
    ) -> Result<Tensor> {
        let out = match chunk_size {
            Some(chunk_size) => self.forward_chunked(x, chunk_size, train)?,
            None => self.body(x, ConvBranch::FullSequence, train)?,
        };

        match mask {
            Some(mask) => {
                let mask = mask.ne(0f64)?.broadcast_as(out.shape())?;
                Ok(mask.where_cond(&out.zeros_like()?, &out)?)
            }
            None => Ok(out),
        }
    }

    fn forward_chunked(&self, x: &Tensor, chunk_size: usize, train: bool) -> Result<Tensor> {
        if self.config.causal {
            return Err(Error::CausalChunking);
        }
        if chunk_size == 0 {
            return Err(Error::Config("chunk_size must be > 0".into()));
        }

        let time = x.dim(1)?;
        let chunk_count = time.div_ceil(chunk_size);
        tracing::trace!(
            "chunked convolution: {chunk_count} chunks of {chunk_size} frames, left context {}",
            self.padding
        );

        let mut outputs = Vec::with_capacity(chunk_count);
        for i in 0..chunk_count {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(time);
            let left_context = self.padding.min(start);

            let window = x.narrow(1, start - left_context, end - start + left_context)?;
            // Missing left context and the right side become zero frames.
            let window = window.pad_with_zeros(1, self.padding - left_context, self.padding)?;

            outputs.push(self.body(&window, ConvBranch::ChunkWindow, train)?);
        }

        Ok(Tensor::cat(&outputs, 1)?)
    }

    fn body(&self, x: &Tensor, branch: ConvBranch, train: bool) -> Result<Tensor> {
        let out = self.layer_norm.forward(x)?;

        // [B, T, C] → [B, C, T] for Conv1d
        let out = out.transpose(1, 2)?;
        let out = self.bottleneck.forward(&out)?;
        let out = glu(&out, 1)?;

        let out = match branch {
            ConvBranch::FullSequence => {
                let out = self.conv.forward(&out)?;
                if self.config.causal {
                    let len = out.dim(2)?;
                    out.narrow(2, 0, len - self.padding)?
                } else {
                    out
                }
            }
            ConvBranch::ChunkWindow => self.conv_unpadded.forward(&out)?,
        };

        // [B, C, T] → [B, T, C]
        let out = out.transpose(1, 2)?;
        let out = self.after_norm.forward(&out)?;
        let out = out.apply(&self.config.activation)?;
        let out = self.after_linear.forward(&out)?;
        Ok(self.dropout.forward(&out, train)?)
    }
}
