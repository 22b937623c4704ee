//! Model components.
//!
//! ## Components
//!
//! - [`convolution`] — Conformer convolution module with dynamic chunking
//! - [`encoder`] — encoder layer and stack
//! - [`decoder`] — decoder layer and stack
//! - [`attention`] — relative-position and regular multi-head attention
//! - [`feed_forward`] — pre-normalised feed-forward half-step
//! - [`mask`] — mask construction and conversion helpers
//! - [`probe`] — optional numeric-health hooks

pub mod attention;
pub mod convolution;
pub mod decoder;
pub mod encoder;
pub mod feed_forward;
pub mod mask;
pub mod probe;
