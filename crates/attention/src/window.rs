//! Windowed attention over channel-first feature maps.
//!
//! The wrappers partition a `(batch, channels, height, width)` map into
//! non-overlapping windows, run the inner attention block over every window
//! independently, and reassemble the original spatial layout. Windows share
//! learned weights but never data: attention never crosses a window
//! boundary. Output shape always equals input shape.

use candle_core::{DType, Device, Tensor};
use layers::{NormKind, PrecisionPolicy, SequenceNorm};
use layout::{partition_windows, reassemble_windows, Window2d};

use crate::core::{AttentionError, SdpaConfig};
use crate::mha::{CrossMha, Mha, MhaConfig};

/// Configuration for [`WindowMha2d`].
#[derive(Debug, Clone, PartialEq)]
pub struct WindowMha2dConfig {
    /// Channel count of the feature map.
    pub in_channels: usize,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Spatial extent of the attention windows.
    pub window: Window2d,
    /// Per-head feature width; defaults to `in_channels / num_heads`.
    pub qkv_dim: Option<usize>,
    /// Normalization applied to each partitioned sequence before projection.
    pub norm: NormKind,
    /// Attention-kernel configuration.
    pub attention: SdpaConfig,
}

impl WindowMha2dConfig {
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

    fn mha_config(&self) -> MhaConfig {
        MhaConfig {
            embed_dim: self.in_channels,
            num_heads: self.num_heads,
            qkv_dim: self.qkv_dim,
            attention: self.attention.clone(),
        }
    }
}

/// Windowed multi-head self-attention over a 2-D feature map.
#[derive(Debug, Clone)]
pub struct WindowMha2d {
    window: Window2d,
    norm: SequenceNorm,
    mha: Mha,
    policy: PrecisionPolicy,
}

impl WindowMha2d {
    /// Builds the wrapper and its inner attention block.
    pub fn new(
        config: WindowMha2dConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        let norm = SequenceNorm::new(config.norm, config.in_channels, dtype, device)?;
        let mha = Mha::new(config.mha_config(), device, dtype)?;
        Ok(Self {
            window: config.window,
            norm,
            mha,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// Window geometry this instance partitions with.
    pub fn window(&self) -> Window2d {
        self.window
    }

    /// Inner attention block. Initializer access.
    pub fn mha(&self) -> &Mha {
        &self.mha
    }

    /// Mutable inner attention block. Initializer access.
    pub fn mha_mut(&mut self) -> &mut Mha {
        &mut self.mha
    }

    /// Attends within each window of a `(batch, channels, height, width)`
    /// map. `attn_mask` broadcasts over every window; the `(tokens, tokens)`
    /// matrix from a score-bias module fits directly.
    pub fn forward(
        &self,
        x: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        let (b, c, h, w) = x.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "windowed attention input must be (batch, channels, height, width), got {:?}",
                x.dims()
            ))
        })?;

        let seq = partition_windows(x, self.window)?;
        let seq = self.norm.forward(&seq, &self.policy)?;
        let out = self.mha.forward(&seq, attn_mask)?;
        Ok(reassemble_windows(&out, (b, c, h, w), self.window)?)
    }
}

/// Configuration for [`WindowCrossMha2d`].
#[derive(Debug, Clone, PartialEq)]
pub struct WindowCrossMha2dConfig {
    /// Channel count of both feature maps.
    pub in_channels: usize,
    /// Number of attention heads.
    pub num_heads: usize,
    /// Spatial extent of the attention windows.
    pub window: Window2d,
    /// Per-head feature width; defaults to `in_channels / num_heads`.
    pub qkv_dim: Option<usize>,
    /// Normalization for the query stream.
    pub norm_q: NormKind,
    /// Normalization for the key/value stream.
    pub norm_kv: NormKind,
    /// Attention-kernel configuration.
    pub attention: SdpaConfig,
}

impl WindowCrossMha2dConfig {
    /// Creates a configuration with no normalization on either stream.
    pub fn new(in_channels: usize, num_heads: usize, window: Window2d) -> Self {
        Self {
            in_channels,
            num_heads,
            window,
            qkv_dim: None,
            norm_q: NormKind::Identity,
            norm_kv: NormKind::Identity,
            attention: SdpaConfig::default(),
        }
    }
}

/// Windowed cross-attention between two feature maps of identical shape.
///
/// Each window of the query stream attends only to the co-located window of
/// the key/value stream.
#[derive(Debug, Clone)]
pub struct WindowCrossMha2d {
    window: Window2d,
    norm_q: SequenceNorm,
    norm_kv: SequenceNorm,
    cross: CrossMha,
    policy: PrecisionPolicy,
}

impl WindowCrossMha2d {
    /// Builds the wrapper and its inner cross-attention block.
    pub fn new(
        config: WindowCrossMha2dConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        let norm_q = SequenceNorm::new(config.norm_q, config.in_channels, dtype, device)?;
        let norm_kv = SequenceNorm::new(config.norm_kv, config.in_channels, dtype, device)?;
        let cross = CrossMha::new(
            MhaConfig {
                embed_dim: config.in_channels,
                num_heads: config.num_heads,
                qkv_dim: config.qkv_dim,
                attention: config.attention.clone(),
            },
            device,
            dtype,
        )?;
        Ok(Self {
            window: config.window,
            norm_q,
            norm_kv,
            cross,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// Inner cross-attention block. Initializer access.
    pub fn cross_mha(&self) -> &CrossMha {
        &self.cross
    }

    /// Mutable inner cross-attention block. Initializer access.
    pub fn cross_mha_mut(&mut self) -> &mut CrossMha {
        &mut self.cross
    }

    /// Attends each window of `x1` over the co-located window of `x2`.
    pub fn forward(
        &self,
        x1: &Tensor,
        x2: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        let (b, c, h, w) = x1.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "windowed attention input must be (batch, channels, height, width), got {:?}",
                x1.dims()
            ))
        })?;
        if x1.dims() != x2.dims() {
            return Err(AttentionError::shape(format!(
                "cross-attention maps must share a shape: x1 {:?}, x2 {:?}",
                x1.dims(),
                x2.dims()
            )));
        }

        let seq1 = self
            .norm_q
            .forward(&partition_windows(x1, self.window)?, &self.policy)?;
        let seq2 = self
            .norm_kv
            .forward(&partition_windows(x2, self.window)?, &self.policy)?;
        let out = self.cross.forward(&seq1, &seq2, attn_mask)?;
        Ok(reassemble_windows(&out, (b, c, h, w), self.window)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::Cpu
    }

    #[test]
    fn self_attention_preserves_shape() -> Result<(), AttentionError> {
        let config = WindowMha2dConfig::new(16, 4, Window2d::new(2, 2)?);
        let block = WindowMha2d::new(config, &device(), DType::F32)?;
        let x = Tensor::randn(0f32, 1.0, (2, 16, 8, 6), &device())?;
        let out = block.forward(&x, None)?;
        assert_eq!(out.dims(), x.dims());
        Ok(())
    }

    #[test]
    fn normalized_variant_preserves_shape() -> Result<(), AttentionError> {
        let mut config = WindowMha2dConfig::new(8, 2, Window2d::square(4)?);
        config.norm = NormKind::LayerNorm;
        let block = WindowMha2d::new(config, &device(), DType::F32)?;
        let x = Tensor::randn(0f32, 1.0, (1, 8, 4, 8), &device())?;
        let out = block.forward(&x, None)?;
        assert_eq!(out.dims(), x.dims());
        Ok(())
    }

    #[test]
    fn head_count_changes_values_but_never_shape() -> Result<(), AttentionError> {
        let x = Tensor::randn(0f32, 1.0, (1, 24, 4, 4), &device())?;
        for num_heads in [1usize, 2, 3, 4, 6, 8, 12, 24] {
            let config = WindowMha2dConfig::new(24, num_heads, Window2d::square(2)?);
            let block = WindowMha2d::new(config, &device(), DType::F32)?;
            let out = block.forward(&x, None)?;
            assert_eq!(out.dims(), x.dims(), "num_heads={num_heads}");
        }
        Ok(())
    }

    #[test]
    fn attention_never_crosses_window_boundaries() -> Result<(), AttentionError> {
        let config = WindowMha2dConfig::new(4, 2, Window2d::square(2)?);
        let block = WindowMha2d::new(config, &device(), DType::F32)?;

        let base = Tensor::randn(0f32, 1.0, (1, 4, 4, 4), &device())?;
        let out_base = block.forward(&base, None)?;

        // Perturb a single position inside the top-left window.
        let mut data = base.flatten_all()?.to_vec1::<f32>()?;
        data[0] += 3.0;
        let perturbed = Tensor::from_vec(data, (1, 4, 4, 4), &device())?;
        let out_perturbed = block.forward(&perturbed, None)?;

        let diff = out_base
            .sub(&out_perturbed)?
            .abs()?
            .flatten_all()?
            .to_vec1::<f32>()?;
        // (1, 4, 4, 4) flattens as (channel, row, col); window (2,2) at the
        // origin covers rows 0-1 x cols 0-1 of every channel.
        let mut inside_max = 0f32;
        let mut outside_max = 0f32;
        for (i, d) in diff.iter().enumerate() {
            let row = (i / 4) % 4;
            let col = i % 4;
            if row < 2 && col < 2 {
                inside_max = inside_max.max(*d);
            } else {
                outside_max = outside_max.max(*d);
            }
        }
        assert!(inside_max > 1e-4, "perturbation had no effect in-window");
        assert!(outside_max < 1e-6, "attention leaked across windows");
        Ok(())
    }

    #[test]
    fn cross_attention_preserves_shape() -> Result<(), AttentionError> {
        let mut config = WindowCrossMha2dConfig::new(8, 2, Window2d::square(2)?);
        config.norm_q = NormKind::LayerNorm;
        config.norm_kv = NormKind::LayerNorm;
        let block = WindowCrossMha2d::new(config, &device(), DType::F32)?;
        let x1 = Tensor::randn(0f32, 1.0, (2, 8, 4, 4), &device())?;
        let x2 = Tensor::randn(0f32, 1.0, (2, 8, 4, 4), &device())?;
        let out = block.forward(&x1, &x2, None)?;
        assert_eq!(out.dims(), x1.dims());
        Ok(())
    }

    #[test]
    fn cross_attention_rejects_mismatched_maps() -> Result<(), AttentionError> {
        let config = WindowCrossMha2dConfig::new(8, 2, Window2d::square(2)?);
        let block = WindowCrossMha2d::new(config, &device(), DType::F32)?;
        let x1 = Tensor::randn(0f32, 1.0, (1, 8, 4, 4), &device())?;
        let x2 = Tensor::randn(0f32, 1.0, (1, 8, 4, 6), &device())?;
        assert!(block.forward(&x1, &x2, None).is_err());
        Ok(())
    }

    #[test]
    fn indivisible_spatial_extent_rejected() -> Result<(), AttentionError> {
        let config = WindowMha2dConfig::new(4, 2, Window2d::square(3)?);
        let block = WindowMha2d::new(config, &device(), DType::F32)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 4, 4), &device())?;
        assert!(block.forward(&x, None).is_err());
        Ok(())
    }
}
