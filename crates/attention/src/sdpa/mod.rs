//! Scaled-dot-product attention with head splitting.
//!
//! The entry point accepts `q`, `k`, `v` shaped `(batch, tokens, channels)`,
//! reinterprets them as `(batch, heads, tokens, channels / heads)`, computes
//! `softmax(q·kᵀ / sqrt(channels / heads) + mask) · v` per head, and merges
//! the heads back. The function is pure: no state survives the call.
//!
//! Kernel dispatch follows the policy in
//! [`BackendSelection::resolve`](crate::core::BackendSelection::resolve):
//! batches beyond [`MAX_FUSED_BATCH`](crate::core::MAX_FUSED_BATCH) always
//! take the reference kernel. Additive masks and attention-weight dropout
//! also route to the reference kernel, since the fused kernel supports only the
//! causal flag. Both kernels agree within floating-point tolerance.

mod reference;

#[cfg(feature = "fused")]
mod fused;

use std::sync::OnceLock;

use candle_core::{DType, Tensor};

use crate::core::{AttentionError, Kernel, SdpaConfig};

static ANNOUNCE: OnceLock<()> = OnceLock::new();

/// Computes multi-head scaled-dot-product attention over token sequences.
///
/// `q`, `k`, and `v` must share shape, dtype, and device; `attn_mask`, when
/// present, is an additive tensor whose trailing dimensions are
/// `(tokens, tokens)` and which broadcasts against
/// `(batch, heads, tokens, tokens)`. Channel divisibility by `num_heads` is
/// a caller-level invariant and is not re-checked here.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    num_heads: usize,
    attn_mask: Option<&Tensor>,
    config: &SdpaConfig,
) -> Result<Tensor, AttentionError> {
    if num_heads == 0 {
        return Err(AttentionError::shape("num_heads must be non-zero"));
    }

    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::shape(
            "q, k, v must reside on the same device",
        ));
    }

    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::shape("q, k, v must share the same dtype"));
    }
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }

    let (batch, tokens, channels) = q.dims3().map_err(|_| {
        AttentionError::shape(format!(
            "q must have shape (batch, tokens, channels), got {:?}",
            q.dims()
        ))
    })?;
    if k.dims() != q.dims() || v.dims() != q.dims() {
        return Err(AttentionError::shape(format!(
            "q, k, v must share a shape: q {:?}, k {:?}, v {:?}",
            q.dims(),
            k.dims(),
            v.dims()
        )));
    }

    if let Some(p) = config.dropout_p {
        if !(0.0..1.0).contains(&p) {
            return Err(AttentionError::shape(format!(
                "dropout probability must be in [0, 1), got {p}"
            )));
        }
    }

    if let Some(mask) = attn_mask {
        validate_mask(mask, batch, num_heads, tokens)?;
        if !device.same_device(mask.device()) {
            return Err(AttentionError::shape(
                "attn_mask must reside on the same device as q",
            ));
        }
    }

    let qkv_dim = channels / num_heads;
    let q_heads = split_heads(q, num_heads, qkv_dim)?;
    let k_heads = split_heads(k, num_heads, qkv_dim)?;
    let v_heads = split_heads(v, num_heads, qkv_dim)?;

    // Additive masks and dropout are reference-only concerns; everything
    // else follows the pure batch-size policy.
    let needs_reference =
        attn_mask.is_some() || config.dropout_p.map(|p| p > 0.0).unwrap_or(false);
    let kernel = if needs_reference {
        Kernel::Reference
    } else {
        config.backend.resolve(batch)
    };

    if ANNOUNCE.set(()).is_ok() {
        log::info!(
            "attention::sdpa init backend={:?} kernel={:?} fused_compiled={}",
            config.backend,
            kernel,
            crate::core::BackendSelection::fused_compiled(),
        );
    }

    let context = match kernel {
        Kernel::Reference => {
            reference::attend(&q_heads, &k_heads, &v_heads, attn_mask, config)?
        }
        Kernel::Fused => fused_attend(&q_heads, &k_heads, &v_heads, config)?,
    };

    merge_heads(&context)
}

/// `(batch, tokens, channels)` → `(batch, heads, tokens, channels / heads)`.
fn split_heads(x: &Tensor, num_heads: usize, qkv_dim: usize) -> Result<Tensor, AttentionError> {
    let (batch, tokens, _) = x.dims3()?;
    Ok(x.reshape((batch, tokens, num_heads, qkv_dim))?
        .permute((0, 2, 1, 3))?
        .contiguous()?)
}

/// `(batch, heads, tokens, qkv_dim)` → `(batch, tokens, heads * qkv_dim)`.
fn merge_heads(x: &Tensor) -> Result<Tensor, AttentionError> {
    let (batch, heads, tokens, qkv_dim) = x.dims4()?;
    Ok(x.permute((0, 2, 1, 3))?
        .contiguous()?
        .reshape((batch, tokens, heads * qkv_dim))?)
}

fn validate_mask(
    mask: &Tensor,
    batch: usize,
    num_heads: usize,
    tokens: usize,
) -> Result<(), AttentionError> {
    let dims = mask.dims();
    let ok = match dims {
        [q_len, k_len] => *q_len == tokens && *k_len == tokens,
        [b, q_len, k_len] => (*b == 1 || *b == batch) && *q_len == tokens && *k_len == tokens,
        [b, h, q_len, k_len] => {
            (*b == 1 || *b == batch)
                && (*h == 1 || *h == num_heads)
                && *q_len == tokens
                && *k_len == tokens
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(AttentionError::shape(format!(
            "attn_mask must broadcast to ({batch}, {num_heads}, {tokens}, {tokens}), got {dims:?}"
        )))
    }
}

#[cfg(feature = "fused")]
fn fused_attend(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    config: &SdpaConfig,
) -> Result<Tensor, AttentionError> {
    fused::attend(q, k, v, config.causal)
}

#[cfg(not(feature = "fused"))]
fn fused_attend(
    _q: &Tensor,
    _k: &Tensor,
    _v: &Tensor,
    _config: &SdpaConfig,
) -> Result<Tensor, AttentionError> {
    Err(AttentionError::UnsupportedBackend {
        reason: "fused kernels are not compiled in (enable the `fused` feature)".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BackendSelection;
    use crate::masks::build_causal_mask;
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let q: Vec<f32> = (0..2 * 4 * 8).map(|i| (i as f32) * 0.013 - 0.4).collect();
        let k: Vec<f32> = (0..2 * 4 * 8).map(|i| (i as f32) * -0.007 + 0.2).collect();
        let v: Vec<f32> = (0..2 * 4 * 8).map(|i| (i as f32) * 0.021 - 0.7).collect();
        Ok((
            Tensor::from_vec(q, (2, 4, 8), device)?,
            Tensor::from_vec(k, (2, 4, 8), device)?,
            Tensor::from_vec(v, (2, 4, 8), device)?,
        ))
    }

    /// Scalar-loop attention used as the ground truth in these tests.
    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        num_heads: usize,
        mask: Option<&Tensor>,
    ) -> CandleResult<Tensor> {
        let (batch, tokens, channels) = q.dims3()?;
        let qkv_dim = channels / num_heads;
        let q_vec = q.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.flatten_all()?.to_vec1::<f32>()?;
        let mask_vec = match mask {
            Some(m) => Some(m.flatten_all()?.to_vec1::<f32>()?),
            None => None,
        };
        let scale = 1.0 / (qkv_dim as f32).sqrt();
        let at = |b: usize, t: usize, h: usize, d: usize| {
            (b * tokens + t) * channels + h * qkv_dim + d
        };

        let mut output = vec![0f32; batch * tokens * channels];
        for b in 0..batch {
            for h in 0..num_heads {
                for qi in 0..tokens {
                    let mut row = vec![0f32; tokens];
                    let mut max_val = f32::NEG_INFINITY;
                    for ki in 0..tokens {
                        let mut dot = 0f32;
                        for d in 0..qkv_dim {
                            dot += q_vec[at(b, qi, h, d)] * k_vec[at(b, ki, h, d)];
                        }
                        dot *= scale;
                        if let Some(mask_vec) = &mask_vec {
                            dot += mask_vec[qi * tokens + ki];
                        }
                        row[ki] = dot;
                        if dot.is_finite() && dot > max_val {
                            max_val = dot;
                        }
                    }
                    let mut denom = 0f32;
                    for val in row.iter_mut() {
                        if *val == f32::NEG_INFINITY {
                            *val = 0.0;
                        } else {
                            *val = (*val - max_val).exp();
                            denom += *val;
                        }
                    }
                    for d in 0..qkv_dim {
                        let mut acc = 0f32;
                        for ki in 0..tokens {
                            acc += row[ki] / denom * v_vec[at(b, ki, h, d)];
                        }
                        output[at(b, qi, h, d)] = acc;
                    }
                }
            }
        }
        Tensor::from_vec(output, (batch, tokens, channels), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn matches_naive_reference() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        for num_heads in [1usize, 2, 4] {
            let out =
                scaled_dot_product_attention(&q, &k, &v, num_heads, None, &SdpaConfig::default())
                    .unwrap();
            let expected = naive_attention(&q, &k, &v, num_heads, None)?;
            assert_eq!(out.dims(), &[2, 4, 8]);
            assert!(max_diff(&out, &expected)? < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn additive_mask_matches_naive_reference() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = build_causal_mask(&device, 4, 4)?;
        let out = scaled_dot_product_attention(&q, &k, &v, 2, Some(&mask), &SdpaConfig::default())
            .unwrap();
        let expected = naive_attention(&q, &k, &v, 2, Some(&mask))?;
        assert!(max_diff(&out, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn causal_flag_matches_explicit_causal_mask() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let config = SdpaConfig {
            causal: true,
            backend: BackendSelection::Reference,
            ..SdpaConfig::default()
        };
        let out = scaled_dot_product_attention(&q, &k, &v, 2, None, &config).unwrap();
        let mask = build_causal_mask(&device, 4, 4)?;
        let expected = naive_attention(&q, &k, &v, 2, Some(&mask))?;
        assert!(max_diff(&out, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn causal_first_token_ignores_the_future() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let config = SdpaConfig {
            causal: true,
            ..SdpaConfig::default()
        };
        let out_a = scaled_dot_product_attention(&q, &k, &v, 2, None, &config).unwrap();

        // Rewrite everything after token 0; its output must not move.
        let noise = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
        let k_mut = Tensor::cat(&[&k.narrow(1, 0, 1)?, &noise], 1)?;
        let v_mut = Tensor::cat(&[&v.narrow(1, 0, 1)?, &noise], 1)?;
        let out_b = scaled_dot_product_attention(&q, &k_mut, &v_mut, 2, None, &config).unwrap();

        let first_a = out_a.narrow(1, 0, 1)?;
        let first_b = out_b.narrow(1, 0, 1)?;
        assert!(max_diff(&first_a.contiguous()?, &first_b.contiguous()?)? < 1e-6);
        Ok(())
    }

    #[test]
    fn reduced_precision_inputs_round_trip() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let reference =
            scaled_dot_product_attention(&q, &k, &v, 2, None, &SdpaConfig::default()).unwrap();
        for dtype in [DType::BF16, DType::F16] {
            let out = scaled_dot_product_attention(
                &q.to_dtype(dtype)?,
                &k.to_dtype(dtype)?,
                &v.to_dtype(dtype)?,
                2,
                None,
                &SdpaConfig::default(),
            )
            .unwrap();
            assert_eq!(out.dtype(), dtype);
            assert!(
                max_diff(&out, &reference)? < 5e-2,
                "dtype {dtype:?} diverged"
            );
        }
        Ok(())
    }

    #[test]
    fn zero_dropout_is_deterministic() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let config = SdpaConfig {
            dropout_p: Some(0.0),
            ..SdpaConfig::default()
        };
        let out = scaled_dot_product_attention(&q, &k, &v, 2, None, &config).unwrap();
        let reference =
            scaled_dot_product_attention(&q, &k, &v, 2, None, &SdpaConfig::default()).unwrap();
        assert!(max_diff(&out, &reference)? < 1e-6);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_rejected() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 4, 8), DType::F32, &device).unwrap();
        let err = scaled_dot_product_attention(&q, &k, &v, 2, None, &SdpaConfig::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn mask_with_wrong_token_extent_rejected() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 4, 8), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((3, 3), DType::F32, &device).unwrap();
        let err = scaled_dot_product_attention(&q, &q, &q, 2, Some(&mask), &SdpaConfig::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn integer_dtypes_rejected() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 4, 8), DType::U32, &device).unwrap();
        let err = scaled_dot_product_attention(&q, &q, &q, 2, None, &SdpaConfig::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedDType { .. }));
    }

    #[test]
    fn invalid_dropout_rejected() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 4, 8), DType::F32, &device).unwrap();
        let config = SdpaConfig {
            dropout_p: Some(1.0),
            ..SdpaConfig::default()
        };
        let err = scaled_dot_product_attention(&q, &q, &q, 2, None, &config).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }
}
