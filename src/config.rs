//! Configuration for Conformer encoders, decoders and their convolution modules.
//!
//! Field names and defaults follow the reference recipes, so a JSON config
//! written for them deserializes directly:
//!
//! ```json
//! {"num_layers": 12, "d_model": 256, "d_ffn": 1024, "nhead": 4,
//!  "kernel_size": 31, "attention_type": "RelPosMHAXL"}
//! ```

use std::fmt;
use std::path::Path;

use candle_nn::Activation;
use serde::Deserialize;

use crate::{Error, Result};

/// Attention variant used by every layer of a stack, chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AttentionType {
    /// Transformer-XL style relative-position attention. Needs `pos_embs`.
    #[serde(rename = "RelPosMHAXL")]
    RelPosMhaXl,
    /// Plain scaled dot-product multi-head attention.
    #[serde(rename = "regularMHA")]
    RegularMha,
}

impl AttentionType {
    /// Whether this variant consumes relative positional embeddings.
    pub fn requires_pos_embs(self) -> bool {
        matches!(self, AttentionType::RelPosMhaXl)
    }
}

impl fmt::Display for AttentionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttentionType::RelPosMhaXl => write!(f, "RelPosMHAXL"),
            AttentionType::RegularMha => write!(f, "regularMHA"),
        }
    }
}

// ---------------------------------------------------------------------------
// Convolution module
// ---------------------------------------------------------------------------

/// Construction options for a [`ConvolutionModule`](crate::model::convolution::ConvolutionModule).
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionModuleConfig {
    /// Channel width (`d_model`).
    pub input_size: usize,
    /// Kernel size of the depthwise convolution.
    pub kernel_size: usize,
    /// Bias on the pointwise and depthwise convolutions and the output projection.
    pub bias: bool,
    /// Activation applied after the depthwise convolution.
    pub activation: Activation,
    /// Dropout on the module output.
    pub dropout: f32,
    /// Causal padding + chomp instead of symmetric padding.
    pub causal: bool,
    /// Dilation of the depthwise convolution.
    pub dilation: usize,
}

impl ConvolutionModuleConfig {
    pub fn new(input_size: usize, kernel_size: usize) -> Self {
        Self {
            input_size,
            kernel_size,
            bias: true,
            activation: Activation::Swish,
            dropout: 0.0,
            causal: false,
            dilation: 1,
        }
    }

    /// Frames of padding around the depthwise convolution.
    ///
    /// `(kernel_size - 1) * 2^(dilation - 1)`, halved (floor) when non-causal.
    /// Also the left context carried into every chunk in chunked mode.
    pub fn padding(&self) -> usize {
        let shift = u32::try_from(self.dilation.saturating_sub(1)).unwrap_or(u32::MAX);
        let full = 1usize
            .checked_shl(shift)
            .and_then(|scale| self.kernel_size.saturating_sub(1).checked_mul(scale))
            .unwrap_or(usize::MAX);
        if self.causal {
            full
        } else {
            full / 2
        }
    }

    /// Checks that the derived padding keeps the time length unchanged.
    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            return Err(Error::Config("convolution input_size must be > 0".into()));
        }
        if self.kernel_size == 0 {
            return Err(Error::Config("convolution kernel_size must be > 0".into()));
        }
        if self.dilation == 0 {
            return Err(Error::Config("convolution dilation must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.dilation > 2 {
            return Err(Error::Config(format!(
                "convolution dilation {} changes the sequence length (at most 2 is supported)",
                self.dilation
            )));
        }
        let receptive = self.dilation * (self.kernel_size - 1);
        let padding = self.padding();
        // causal: pad both sides then chomp `padding`; non-causal: symmetric.
        let preserved = if self.causal {
            padding == receptive
        } else {
            2 * padding == receptive
        };
        if !preserved {
            return Err(Error::Config(format!(
                "kernel_size={} dilation={} causal={} gives padding {} which changes the sequence length",
                self.kernel_size, self.dilation, self.causal, padding
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Encoder / decoder stacks
// ---------------------------------------------------------------------------

/// Configuration shared by [`ConformerEncoder`](crate::model::encoder::ConformerEncoder)
/// and [`ConformerDecoder`](crate::model::decoder::ConformerDecoder).
#[derive(Debug, Clone, Deserialize)]
pub struct ConformerConfig {
    /// Number of layers in the stack.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Model / channel width.
    #[serde(default = "default_d_model")]
    pub d_model: usize,

    /// Hidden width of the macaron feed-forward modules.
    #[serde(default = "default_d_ffn")]
    pub d_ffn: usize,

    /// Number of attention heads.
    #[serde(default = "default_nhead")]
    pub nhead: usize,

    /// Kernel size of the convolution module.
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,

    /// Key feature size for regular attention (defaults to `d_model`).
    #[serde(default)]
    pub kdim: Option<usize>,

    /// Value feature size for regular attention (defaults to `d_model`).
    #[serde(default)]
    pub vdim: Option<usize>,

    /// Activation of the feed-forward and convolution modules.
    #[serde(default = "default_activation")]
    pub activation: Activation,

    /// Bias on the convolution module's layers.
    #[serde(default = "default_bias")]
    pub bias: bool,

    /// Dropout rate used by every sub-module.
    #[serde(default)]
    pub dropout: f32,

    /// Causal convolution (and future-masked positional attention).
    #[serde(default)]
    pub causal: bool,

    /// Attention variant.
    #[serde(default = "default_attention_type")]
    pub attention_type: AttentionType,
}

impl Default for ConformerConfig {
    fn default() -> Self {
        Self {
            num_layers: default_num_layers(),
            d_model: default_d_model(),
            d_ffn: default_d_ffn(),
            nhead: default_nhead(),
            kernel_size: default_kernel_size(),
            kdim: None,
            vdim: None,
            activation: default_activation(),
            bias: default_bias(),
            dropout: 0.0,
            causal: false,
            attention_type: default_attention_type(),
        }
    }
}

impl ConformerConfig {
    /// Encoder defaults: kernel 31, non-causal, relative-position attention.
    pub fn encoder(num_layers: usize, d_model: usize, d_ffn: usize, nhead: usize) -> Self {
        Self {
            num_layers,
            d_model,
            d_ffn,
            nhead,
            ..Self::default()
        }
    }

    /// Decoder defaults: kernel 3, causal.
    pub fn decoder(num_layers: usize, d_model: usize, d_ffn: usize, nhead: usize) -> Self {
        Self {
            num_layers,
            d_model,
            d_ffn,
            nhead,
            kernel_size: 3,
            causal: true,
            ..Self::default()
        }
    }

    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Per-head width; fails unless `d_model` splits evenly over `nhead > 0` heads.
    pub fn head_dim(&self) -> Result<usize> {
        head_dim(self.d_model, self.nhead)
    }

    /// Convolution module options derived from this config.
    pub fn convolution(&self) -> ConvolutionModuleConfig {
        ConvolutionModuleConfig {
            input_size: self.d_model,
            kernel_size: self.kernel_size,
            bias: self.bias,
            activation: self.activation,
            dropout: self.dropout,
            causal: self.causal,
            dilation: 1,
        }
    }

    /// Checks the sizes that every layer relies on.
    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 || self.nhead == 0 || self.d_ffn == 0 {
            return Err(Error::Config(
                "d_model, d_ffn and nhead must all be > 0".into(),
            ));
        }
        self.head_dim()?;
        if self.attention_type == AttentionType::RelPosMhaXl
            && (self.kdim.is_some_and(|k| k != self.d_model)
                || self.vdim.is_some_and(|v| v != self.d_model))
        {
            return Err(Error::Config(
                "kdim/vdim are only supported with regularMHA".into(),
            ));
        }
        self.convolution().validate()
    }
}

/// Width of one attention head.
pub(crate) fn head_dim(d_model: usize, num_heads: usize) -> Result<usize> {
    if num_heads == 0 || d_model % num_heads != 0 {
        return Err(Error::Config(format!(
            "d_model ({d_model}) must be divisible by nhead ({num_heads})"
        )));
    }
    Ok(d_model / num_heads)
}

fn default_num_layers() -> usize {
    12
}
fn default_d_model() -> usize {
    256
}
fn default_d_ffn() -> usize {
    1024
}
fn default_nhead() -> usize {
    4
}
fn default_kernel_size() -> usize {
    31
}
fn default_activation() -> Activation {
    Activation::Swish
}
fn default_bias() -> bool {
    true
}
fn default_attention_type() -> AttentionType {
    AttentionType::RelPosMhaXl
}
