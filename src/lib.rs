//! Conformer encoder and decoder blocks in pure Rust.
//!
//! A candle-based implementation of the Conformer layer family used by
//! speech models: macaron feed-forward half-steps around multi-head
//! attention and a depthwise convolution module, stacked into encoders and
//! decoders.
//!
//! ## Architecture
//!
//! ```text
//! src ──→ ConformerEncoder (N × layer: ½FFN → MHA → Conv → ½FFN → norm) ──→ memory
//!                                                                          │
//! tgt ──→ ConformerDecoder (N × layer: ½FFN → cross-MHA → causal Conv → ½FFN → norm)
//! ```
//!
//! The encoder's convolution module can run in dynamic chunk mode, where
//! every chunk sees its own frames plus a bounded left context and never
//! looks into later chunks.
//!
//! ## Modules
//!
//! - [`config`] — serde-loadable layer/stack configuration
//! - [`model`] — convolution module, attention, encoder, decoder, masks, probes

pub mod config;
pub mod model;

mod error;

pub use config::{AttentionType, ConformerConfig, ConvolutionModuleConfig};
pub use error::{Error, Result};
pub use model::decoder::{ConformerDecoder, ConformerDecoderLayer, DecoderInputs, Diagnostic};
pub use model::encoder::{ConformerEncoder, ConformerEncoderLayer, EncoderInputs};
