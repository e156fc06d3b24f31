//! Fused attention kernel backed by `candle-flash-attn`.
//!
//! Only compiled with the `fused` feature. The flash kernel wants
//! `(batch, tokens, heads, qkv_dim)` inputs in `f16`/`bf16` on a CUDA
//! device; this adapter permutes from and back to the
//! `(batch, heads, tokens, qkv_dim)` layout the dispatcher works in.
//! Masks and dropout never reach this path; the dispatcher routes them to
//! the reference kernel.

use candle_core::{DType, Tensor};

use crate::core::AttentionError;

pub(super) fn attend(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    causal: bool,
) -> Result<Tensor, AttentionError> {
    let dtype = q.dtype();
    if !matches!(dtype, DType::F16 | DType::BF16) {
        return Err(AttentionError::UnsupportedBackend {
            reason: format!(
                "fused kernel requires f16/bf16 inputs, got {dtype:?}; \
                 select BackendSelection::Reference for f32"
            ),
        });
    }

    let (_, _, _, qkv_dim) = q.dims4()?;
    let softmax_scale = 1.0 / (qkv_dim as f32).sqrt();

    let q_t = q.permute((0, 2, 1, 3))?.contiguous()?;
    let k_t = k.permute((0, 2, 1, 3))?.contiguous()?;
    let v_t = v.permute((0, 2, 1, 3))?.contiguous()?;

    let context = candle_flash_attn::flash_attn(&q_t, &k_t, &v_t, softmax_scale, causal)?;
    Ok(context.permute((0, 2, 1, 3))?.contiguous()?)
}
