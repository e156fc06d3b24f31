//! Portable reference attention kernel.
//!
//! Prioritises numerical fidelity: scores and softmax accumulate in `f32`
//! regardless of the incoming dtype, and the output is cast back to the
//! input dtype. This is the guaranteed-correct path every other kernel is
//! measured against, and the only one that applies additive masks and
//! attention-weight dropout.

use candle_core::{Tensor, D};
use candle_nn::ops::{dropout, softmax_last_dim};
use layers::PrecisionPolicy;

use crate::core::{AttentionError, SdpaConfig};
use crate::masks::build_causal_mask;

/// Attends over `(batch, heads, tokens, qkv_dim)` inputs.
pub(super) fn attend(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    attn_mask: Option<&Tensor>,
    config: &SdpaConfig,
) -> Result<Tensor, AttentionError> {
    let (_, _, tokens, qkv_dim) = q.dims4()?;
    let policy = PrecisionPolicy::from_parameter_dtype(q.dtype());

    let q_work = policy.cast_for_matmul(q)?;
    let k_work = policy.cast_for_matmul(k)?;
    let v_work = policy.cast_for_matmul(v)?;

    let scale = 1.0 / (qkv_dim as f64).sqrt();
    let mut scores = q_work
        .matmul(&k_work.transpose(D::Minus2, D::Minus1)?)?
        .affine(scale, 0.0)?;

    if config.causal {
        let causal = build_causal_mask(q.device(), tokens, tokens)?;
        scores = scores.broadcast_add(&causal.to_dtype(scores.dtype())?)?;
    }
    if let Some(mask) = attn_mask {
        scores = scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?;
    }

    let mut probs = softmax_last_dim(&scores)?;
    if let Some(dropout_p) = config.dropout_p {
        if dropout_p > 0.0 {
            probs = dropout(&probs, dropout_p)?;
        }
    }

    let context = probs.matmul(&v_work)?;
    Ok(policy.cast_to_storage(&context)?)
}
