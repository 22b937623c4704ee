//! Mask helpers shared by attention and the convolution module.
//!
//! Boolean masks are integer tensors where a nonzero entry marks a position
//! that must be excluded (a padded frame, or a key the query may not see).
//! Attention consumes them as additive biases: 0.0 where visible and the
//! dtype's most negative finite value where masked. Float masks are taken to
//! be additive already.

use candle_core::{DType, Device, Tensor};

use crate::Result;

/// Most negative finite value representable in `dtype`.
pub fn min_value(dtype: DType) -> f64 {
    match dtype {
        DType::F32 => f64::from(f32::MIN),
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Whether a mask of this dtype carries boolean (nonzero = masked) semantics.
pub fn is_boolean(dtype: DType) -> bool {
    matches!(dtype, DType::U8 | DType::U32 | DType::I64)
}

/// Convert a mask to an additive bias of `dtype`.
pub fn additive_mask(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    if is_boolean(mask.dtype()) {
        let masked = mask.ne(0f64)?.to_dtype(dtype)?;
        Ok((masked * min_value(dtype))?)
    } else {
        Ok(mask.to_dtype(dtype)?)
    }
}

/// Look-ahead mask `[len, len]` (`u8`): 1 where key `j` lies after query `i`.
pub fn causal_mask(len: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<u8> = (0..len)
        .flat_map(|i| (0..len).map(move |j| u8::from(j > i)))
        .collect();
    Ok(Tensor::from_vec(data, (len, len), device)?)
}

/// Lower-triangular ones `[rows, cols]` keeping entries with `j <= i + offset`.
pub fn tril_ones(
    rows: usize,
    cols: usize,
    offset: isize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let data: Vec<f32> = (0..rows)
        .flat_map(|i| {
            (0..cols).map(move |j| {
                if (j as isize) <= i as isize + offset {
                    1.0
                } else {
                    0.0
                }
            })
        })
        .collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?.to_dtype(dtype)?)
}

/// Key-padding mask `[B, max_len]` (`u8`, 1 = padded) from valid lengths.
pub fn padding_mask_from_lengths(
    lengths: &[usize],
    max_len: usize,
    device: &Device,
) -> Result<Tensor> {
    let data: Vec<u8> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| u8::from(t >= len)))
        .collect();
    Ok(Tensor::from_vec(data, (lengths.len(), max_len), device)?)
}

/// Reshape a `[B, T]` key-padding mask into the convolution module's `[B, T, 1]` form.
pub fn conv_mask(key_padding_mask: &Tensor) -> Result<Tensor> {
    Ok(key_padding_mask.ne(0f64)?.unsqueeze(2)?)
}
