//! Numeric-health probes.
//!
//! Layers and stacks accept an optional [`Probe`] which is called with the
//! running tensor and a checkpoint label at fixed points of the forward pass.
//! Nothing is probed unless a probe is installed.

use std::sync::Arc;

use candle_core::Tensor;

/// Callback invoked with `(tensor, checkpoint_label)`.
pub type Probe = Arc<dyn Fn(&Tensor, &str) + Send + Sync>;

/// Run `probe` on `x` if one is installed.
pub(crate) fn observe(probe: Option<&Probe>, x: &Tensor, label: &str) {
    if let Some(probe) = probe {
        probe(x, label);
    }
}

/// Number of NaN entries in `x`.
pub fn count_nan(x: &Tensor) -> candle_core::Result<usize> {
    // NaN is the only value not equal to itself.
    let nan = x.ne(x)?.to_dtype(candle_core::DType::U32)?;
    let count: u32 = nan.sum_all()?.to_scalar()?;
    Ok(count as usize)
}

/// Probe that logs a warning whenever a checkpoint tensor contains NaNs.
pub fn nan_probe() -> Probe {
    Arc::new(|x: &Tensor, label: &str| match count_nan(x) {
        Ok(0) => {}
        Ok(n) => tracing::warn!("found {n} NaN values at {label} (shape {:?})", x.dims()),
        Err(e) => tracing::warn!("NaN probe failed at {label}: {e}"),
    })
}
