//! Overlapping-window attention.
//!
//! Non-overlapping windows create hard boundaries with no cross-window
//! context. This variant runs windowed attention twice: once on the
//! unshifted grid, once on a grid zero-padded by half a window per side and
//! trimmed back. The two outputs are summed, so every position receives
//! context from two differently-aligned window partitions. A two-pass
//! approximation of a shifted-window scheme, without full quadratic
//! attention cost.
//!
//! The query/key/value map is produced by a single 1×1 convolution over the
//! full feature map before any windowing, decoupled from the projection
//! inside [`Mha`](crate::mha::Mha).

use candle_core::{DType, Device, Tensor};
use layers::{
    LinearInit, NormKind, PointwiseConv2d, PointwiseConv2dConfig, PrecisionPolicy, SequenceNorm,
};
use layout::{channels_first, channels_last, partition_windows, reassemble_windows, Window2d};

use crate::core::{AttentionError, SdpaConfig};
use crate::mha::resolve_qkv_dim;
use crate::sdpa::scaled_dot_product_attention;

/// Configuration for [`OverlapWindowMha2d`].
#[derive(Debug, Clone, PartialEq)]
pub struct OverlapWindowMha2dConfig {
    /// Channel count of the feature map.
    pub in_channels: usize,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Spatial extent of the attention windows.
    pub window: Window2d,
    /// Per-head feature width; defaults to `in_channels / num_heads`.
    pub qkv_dim: Option<usize>,
    /// Normalization applied to the full map before projection.
    pub norm: NormKind,
    /// Attention-kernel configuration.
    pub attention: SdpaConfig,
}

impl OverlapWindowMha2dConfig {
    /// Creates a configuration with no normalization and default attention
    /// settings.
    pub fn new(in_channels: usize, num_heads: usize, window: Window2d) -> Self {
        Self {
            in_channels,
            num_heads,
            window,
            qkv_dim: None,
            norm: NormKind::Identity,
            attention: SdpaConfig::default(),
        }
    }
}

/// Windowed self-attention summed over two half-window-shifted partitions.
#[derive(Debug, Clone)]
pub struct OverlapWindowMha2d {
    window: Window2d,
    pad: (usize, usize),
    num_heads: usize,
    qkv_dim: usize,
    norm: SequenceNorm,
    qkv_proj: PointwiseConv2d,
    head_proj: PointwiseConv2d,
    attention: SdpaConfig,
    policy: PrecisionPolicy,
}

impl OverlapWindowMha2d {
    /// Builds the block, failing fast on divisibility violations and
    /// unsupported backend selections.
    pub fn new(
        config: OverlapWindowMha2dConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.attention.backend.ensure_supported()?;
        let qkv_dim = resolve_qkv_dim(config.in_channels, config.num_heads, config.qkv_dim)?;
        let inner = config.num_heads * qkv_dim;

        let norm = SequenceNorm::new(config.norm, config.in_channels, dtype, device)?;
        let mut qkv_config = PointwiseConv2dConfig::new(config.in_channels, inner);
        qkv_config.fused_projections = 3;
        let qkv_proj =
            PointwiseConv2d::with_init(qkv_config, &LinearInit::XavierUniform, device, dtype)?;
        let head_proj = PointwiseConv2d::with_init(
            PointwiseConv2dConfig::new(inner, config.in_channels),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;

        Ok(Self {
            window: config.window,
            pad: (config.window.height / 2, config.window.width / 2),
            num_heads: config.num_heads,
            qkv_dim,
            norm,
            qkv_proj,
            head_proj,
            attention: config.attention,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// Window geometry this instance partitions with.
    pub fn window(&self) -> Window2d {
        self.window
    }

    /// Packed query/key/value projection. Initializer access.
    pub fn qkv_proj(&self) -> &PointwiseConv2d {
        &self.qkv_proj
    }

    /// Mutable packed projection. Initializer access.
    pub fn qkv_proj_mut(&mut self) -> &mut PointwiseConv2d {
        &mut self.qkv_proj
    }

    /// Output projection. Initializer access.
    pub fn head_proj(&self) -> &PointwiseConv2d {
        &self.head_proj
    }

    /// Mutable output projection. Initializer access.
    pub fn head_proj_mut(&mut self) -> &mut PointwiseConv2d {
        &mut self.head_proj
    }

    /// Attends within the unshifted and half-shifted window partitions of a
    /// `(batch, channels, height, width)` map and sums the two results.
    pub fn forward(
        &self,
        x: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        let (_, _, h, w) = x.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "overlap-window attention input must be (batch, channels, height, width), got {:?}",
                x.dims()
            ))
        })?;

        let x = if self.norm.is_identity() {
            x.clone()
        } else {
            let nhwc = channels_last(x)?;
            let (b, hh, ww, c) = nhwc.dims4()?;
            let seq = self.norm.forward(&nhwc.reshape((b, hh * ww, c))?, &self.policy)?;
            channels_first(&seq.reshape((b, hh, ww, c))?)?
        };

        let qkv = self.qkv_proj.forward(&x, &self.policy)?;

        let unshifted = self.attend_windows(&qkv, attn_mask)?;

        let padded = qkv
            .pad_with_zeros(2, self.pad.0, self.pad.0)?
            .pad_with_zeros(3, self.pad.1, self.pad.1)?;
        let shifted = self.attend_windows(&padded, attn_mask)?;
        let shifted = shifted
            .narrow(2, self.pad.0, h)?
            .narrow(3, self.pad.1, w)?
            .contiguous()?;

        // Branch outputs are summed as-is: no averaging, no learned blend.
        let summed = (unshifted + shifted)?;
        Ok(self.head_proj.forward(&summed, &self.policy)?)
    }

    /// Runs per-window attention over a packed q/k/v map and restores the
    /// map layout with `heads * qkv_dim` channels.
    fn attend_windows(
        &self,
        qkv_map: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        let (b, _, h, w) = qkv_map.dims4()?;
        let inner = self.num_heads * self.qkv_dim;

        let seq = partition_windows(qkv_map, self.window)?;
        let q = seq.narrow(2, 0, inner)?.contiguous()?;
        let k = seq.narrow(2, inner, inner)?.contiguous()?;
        let v = seq.narrow(2, 2 * inner, inner)?.contiguous()?;

        let out =
            scaled_dot_product_attention(&q, &k, &v, self.num_heads, attn_mask, &self.attention)?;
        Ok(reassemble_windows(&out, (b, inner, h, w), self.window)?)
    }
}
