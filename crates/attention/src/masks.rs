//! Additive attention-mask utilities.
//!
//! Masks are additive `f32` tensors whose trailing two dimensions are
//! `(q_len, k_len)`; entries are `0.0` (keep) or `f32::NEG_INFINITY`
//! (discard), aligning with softmax-friendly masking. A mask broadcasts
//! against `(batch, heads, q_len, k_len)` attention scores, so a plain
//! 2-D matrix, for example the output of
//! [`WindowScoreBias`](crate::bias::WindowScoreBias), is accepted as-is.

use candle_core::{DType, Device, Result, Tensor};

/// Dtype shared by all additive masks built here.
pub const MASK_DTYPE: DType = DType::F32;

/// Constructs a `(q_len, k_len)` causal mask.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix.
pub fn build_causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let mut data = vec![0f32; q_len * k_len];
    let offset = k_len.saturating_sub(q_len);

    for q in 0..q_len {
        let row = q * k_len;
        for k in (q + offset + 1)..k_len {
            data[row + k] = f32::NEG_INFINITY;
        }
    }

    Tensor::from_vec(data, (q_len, k_len), device)
}
