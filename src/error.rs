//! Error types for conformer-rs.

use crate::config::AttentionType;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error (shape mismatches surface here untranslated).
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Chunked convolution requested on a causal convolution module.
    #[error("config: chunked convolution is not supported with causal padding")]
    CausalChunking,

    /// Relative-position attention was selected but no positional embeddings were given.
    #[error("config: attention type {attention} requires positional embeddings")]
    MissingPositionalEmbeddings {
        /// The attention variant that needed them.
        attention: AttentionType,
    },

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
