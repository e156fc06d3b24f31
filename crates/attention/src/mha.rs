//! Self- and cross-attention blocks over token sequences.
//!
//! [`Mha`] projects a `(batch, tokens, embed_dim)` sequence to packed
//! query/key/value with a single fused linear map, attends, and projects the
//! merged heads back to `embed_dim`. [`CrossMha`] keeps separate projections
//! for the query stream and the key/value stream. Both validate their
//! backend selection at construction time: an unsupported kernel is a fatal
//! capability failure, not something to degrade around.

use candle_core::{DType, Device, Tensor};
use layers::{Linear, LinearConfig, LinearInit, PrecisionPolicy};

use crate::core::{AttentionError, SdpaConfig};
use crate::sdpa::scaled_dot_product_attention;

/// Configuration shared by [`Mha`] and [`CrossMha`].
#[derive(Debug, Clone, PartialEq)]
pub struct MhaConfig {
    /// Feature width of the input and output sequences.
    pub embed_dim: usize,
    /// Number of parallel attention heads.
    pub num_heads: usize,
    /// Per-head feature width. When `None`, `embed_dim` must divide evenly
    /// by `num_heads` and each head gets `embed_dim / num_heads`.
    pub qkv_dim: Option<usize>,
    /// Attention-kernel configuration threaded into every forward call.
    pub attention: SdpaConfig,
}

impl MhaConfig {
    /// Creates a configuration with the default attention settings.
    pub fn new(embed_dim: usize, num_heads: usize) -> Self {
        Self {
            embed_dim,
            num_heads,
            qkv_dim: None,
            attention: SdpaConfig::default(),
        }
    }

    pub(crate) fn resolved_qkv_dim(&self) -> Result<usize, AttentionError> {
        resolve_qkv_dim(self.embed_dim, self.num_heads, self.qkv_dim)
    }
}

pub(crate) fn resolve_qkv_dim(
    embed_dim: usize,
    num_heads: usize,
    qkv_dim: Option<usize>,
) -> Result<usize, AttentionError> {
    if num_heads == 0 {
        return Err(AttentionError::shape("num_heads must be non-zero"));
    }
    match qkv_dim {
        Some(dim) if dim > 0 => Ok(dim),
        Some(_) => Err(AttentionError::shape("qkv_dim must be non-zero")),
        None => {
            if embed_dim % num_heads != 0 {
                Err(AttentionError::shape(format!(
                    "embed_dim ({embed_dim}) is not divisible by num_heads ({num_heads}); \
                     pass an explicit qkv_dim"
                )))
            } else {
                Ok(embed_dim / num_heads)
            }
        }
    }
}

fn expect_sequence(label: &str, x: &Tensor, channels: usize) -> Result<(), AttentionError> {
    match x.dims() {
        [_, _, actual] if *actual == channels => Ok(()),
        dims => Err(AttentionError::shape(format!(
            "{label} must be (batch, tokens, {channels}), got {dims:?}"
        ))),
    }
}

/// Multi-head self-attention block.
#[derive(Debug, Clone)]
pub struct Mha {
    qkv_proj: Linear,
    head_proj: Linear,
    num_heads: usize,
    qkv_dim: usize,
    embed_dim: usize,
    attention: SdpaConfig,
    policy: PrecisionPolicy,
}

impl Mha {
    /// Builds the block, failing fast on divisibility violations and
    /// unsupported backend selections.
    pub fn new(config: MhaConfig, device: &Device, dtype: DType) -> Result<Self, AttentionError> {
        config.attention.backend.ensure_supported()?;
        let qkv_dim = config.resolved_qkv_dim()?;
        let inner = config.num_heads * qkv_dim;

        let mut qkv_config = LinearConfig::new(config.embed_dim, inner);
        qkv_config.fused_projections = 3;
        let qkv_proj = Linear::with_init(qkv_config, &LinearInit::XavierUniform, device, dtype)?;
        let head_proj = Linear::with_init(
            LinearConfig::new(inner, config.embed_dim),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;

        Ok(Self {
            qkv_proj,
            head_proj,
            num_heads: config.num_heads,
            qkv_dim,
            embed_dim: config.embed_dim,
            attention: config.attention,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// Number of attention heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Per-head feature width.
    pub fn qkv_dim(&self) -> usize {
        self.qkv_dim
    }

    /// Packed query/key/value projection. Initializer access.
    pub fn qkv_proj(&self) -> &Linear {
        &self.qkv_proj
    }

    /// Mutable packed projection. Initializer access.
    pub fn qkv_proj_mut(&mut self) -> &mut Linear {
        &mut self.qkv_proj
    }

    /// Output projection. Initializer access.
    pub fn head_proj(&self) -> &Linear {
        &self.head_proj
    }

    /// Mutable output projection. Initializer access.
    pub fn head_proj_mut(&mut self) -> &mut Linear {
        &mut self.head_proj
    }

    /// Attends over a `(batch, tokens, embed_dim)` sequence.
    pub fn forward(
        &self,
        x: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        expect_sequence("attention input", x, self.embed_dim)?;

        let width = self.num_heads * self.qkv_dim;
        let qkv = self.qkv_proj.forward(x, &self.policy)?;
        let q = qkv.narrow(2, 0, width)?.contiguous()?;
        let k = qkv.narrow(2, width, width)?.contiguous()?;
        let v = qkv.narrow(2, 2 * width, width)?.contiguous()?;

        let context =
            scaled_dot_product_attention(&q, &k, &v, self.num_heads, attn_mask, &self.attention)?;
        Ok(self.head_proj.forward(&context, &self.policy)?)
    }
}

/// Multi-head cross-attention block: queries from one stream, keys and
/// values from another of identical shape.
#[derive(Debug, Clone)]
pub struct CrossMha {
    q_proj: Linear,
    kv_proj: Linear,
    head_proj: Linear,
    num_heads: usize,
    qkv_dim: usize,
    embed_dim: usize,
    attention: SdpaConfig,
    policy: PrecisionPolicy,
}

impl CrossMha {
    /// Builds the block with the same construction-time checks as [`Mha`].
    pub fn new(config: MhaConfig, device: &Device, dtype: DType) -> Result<Self, AttentionError> {
        config.attention.backend.ensure_supported()?;
        let qkv_dim = config.resolved_qkv_dim()?;
        let inner = config.num_heads * qkv_dim;

        let q_proj = Linear::with_init(
            LinearConfig::new(config.embed_dim, inner),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        let mut kv_config = LinearConfig::new(config.embed_dim, inner);
        kv_config.fused_projections = 2;
        let kv_proj = Linear::with_init(kv_config, &LinearInit::XavierUniform, device, dtype)?;
        let head_proj = Linear::with_init(
            LinearConfig::new(inner, config.embed_dim),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;

        Ok(Self {
            q_proj,
            kv_proj,
            head_proj,
            num_heads: config.num_heads,
            qkv_dim,
            embed_dim: config.embed_dim,
            attention: config.attention,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// Number of attention heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Query projection. Initializer access.
    pub fn q_proj(&self) -> &Linear {
        &self.q_proj
    }

    /// Mutable query projection. Initializer access.
    pub fn q_proj_mut(&mut self) -> &mut Linear {
        &mut self.q_proj
    }

    /// Packed key/value projection. Initializer access.
    pub fn kv_proj(&self) -> &Linear {
        &self.kv_proj
    }

    /// Mutable packed key/value projection. Initializer access.
    pub fn kv_proj_mut(&mut self) -> &mut Linear {
        &mut self.kv_proj
    }

    /// Output projection. Initializer access.
    pub fn head_proj(&self) -> &Linear {
        &self.head_proj
    }

    /// Mutable output projection. Initializer access.
    pub fn head_proj_mut(&mut self) -> &mut Linear {
        &mut self.head_proj
    }

    /// Attends queries from `q_src` over keys/values from `kv_src`.
    ///
    /// The two streams must share a shape exactly.
    pub fn forward(
        &self,
        q_src: &Tensor,
        kv_src: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        expect_sequence("cross-attention query stream", q_src, self.embed_dim)?;
        if q_src.dims() != kv_src.dims() {
            return Err(AttentionError::shape(format!(
                "cross-attention streams must share a shape: q {:?}, kv {:?}",
                q_src.dims(),
                kv_src.dims()
            )));
        }

        let width = self.num_heads * self.qkv_dim;
        let q = self.q_proj.forward(q_src, &self.policy)?;
        let kv = self.kv_proj.forward(kv_src, &self.policy)?;
        let k = kv.narrow(2, 0, width)?.contiguous()?;
        let v = kv.narrow(2, width, width)?.contiguous()?;

        let context =
            scaled_dot_product_attention(&q, &k, &v, self.num_heads, attn_mask, &self.attention)?;
        Ok(self.head_proj.forward(&context, &self.policy)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn output_shape_matches_input_shape() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let mha = Mha::new(MhaConfig::new(64, 8), &device, DType::F32)?;
        let x = Tensor::randn(0f32, 1.0, (2, 16, 64), &device)?;
        let out = mha.forward(&x, None)?;
        assert_eq!(out.dims(), &[2, 16, 64]);
        Ok(())
    }

    #[test]
    fn indivisible_heads_fail_without_explicit_qkv_dim() {
        let device = Device::Cpu;
        let err = Mha::new(MhaConfig::new(64, 7), &device, DType::F32).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn explicit_qkv_dim_lifts_the_divisibility_requirement() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let mut config = MhaConfig::new(64, 7);
        config.qkv_dim = Some(9);
        let mha = Mha::new(config, &device, DType::F32)?;
        let x = Tensor::randn(0f32, 1.0, (1, 5, 64), &device)?;
        let out = mha.forward(&x, None)?;
        assert_eq!(out.dims(), &[1, 5, 64]);
        Ok(())
    }

    #[test]
    fn cross_attention_rejects_mismatched_streams() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let cross = CrossMha::new(MhaConfig::new(32, 4), &device, DType::F32)?;
        let q = Tensor::randn(0f32, 1.0, (4, 9, 32), &device)?;
        let kv = Tensor::randn(0f32, 1.0, (4, 10, 32), &device)?;
        let err = cross.forward(&q, &kv, None).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
        Ok(())
    }

    #[test]
    fn cross_attention_preserves_shape() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let cross = CrossMha::new(MhaConfig::new(32, 4), &device, DType::F32)?;
        let q = Tensor::randn(0f32, 1.0, (4, 9, 32), &device)?;
        let kv = Tensor::randn(0f32, 1.0, (4, 9, 32), &device)?;
        let out = cross.forward(&q, &kv, None)?;
        assert_eq!(out.dims(), &[4, 9, 32]);
        Ok(())
    }

    #[test]
    fn wrong_channel_count_rejected_at_forward() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let mha = Mha::new(MhaConfig::new(16, 4), &device, DType::F32)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 8), &device)?;
        assert!(mha.forward(&x, None).is_err());
        Ok(())
    }

    #[cfg(not(feature = "fused"))]
    #[test]
    fn forced_fused_backend_fails_at_construction() {
        use crate::core::BackendSelection;
        let device = Device::Cpu;
        let mut config = MhaConfig::new(16, 4);
        config.attention.backend = BackendSelection::Fused;
        let err = Mha::new(config.clone(), &device, DType::F32).unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedBackend { .. }));
        let err = CrossMha::new(config, &device, DType::F32).unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedBackend { .. }));
    }
}
