//! Normalization strategies for windowed token sequences.
//!
//! Inputs follow the `(batch, tokens, channels)` convention; normalization
//! happens along the channel axis with statistics promoted to
//! [`PrecisionPolicy::reduction`] before the output is cast back. The
//! strategies form a closed set: [`SequenceNorm`] is a tagged union chosen
//! at construction time, with `Identity` standing in for "no normalization"
//! so callers never thread optional callables through forward paths.

use candle_core::{DType, Device, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Available normalization strategies for attention wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// Pass-through; the sequence is used as-is.
    Identity,
    /// Standard LayerNorm with learnable scale and bias.
    LayerNorm,
    /// RMSNorm with learnable scale.
    RmsNorm,
}

/// Configuration shared by the affine normalization variants.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Channel count being normalized.
    pub channels: usize,
    /// Numeric stabiliser applied to variance or RMS computations.
    pub epsilon: f64,
}

impl NormConfig {
    /// Creates a configuration with the conventional `1e-5` epsilon.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            epsilon: 1e-5,
        }
    }
}

/// Closed set of normalization strategies, selected at construction.
#[derive(Debug, Clone)]
pub enum SequenceNorm {
    /// No normalization.
    Identity,
    /// LayerNorm over the channel axis.
    LayerNorm {
        weight: Tensor,
        bias: Tensor,
        config: NormConfig,
    },
    /// RMSNorm over the channel axis.
    RmsNorm { weight: Tensor, config: NormConfig },
}

impl SequenceNorm {
    /// Builds a strategy of the given kind with identity-transform parameters
    /// (unit scale, zero bias); the external initializer may replace them via
    /// the `from_parts` constructors.
    pub fn new(kind: NormKind, channels: usize, dtype: DType, device: &Device) -> Result<Self> {
        match kind {
            NormKind::Identity => Ok(Self::Identity),
            NormKind::LayerNorm => Self::layer_norm(
                Tensor::ones(channels, dtype, device)?,
                Tensor::zeros(channels, dtype, device)?,
                NormConfig::new(channels),
            ),
            NormKind::RmsNorm => Self::rms_norm(
                Tensor::ones(channels, dtype, device)?,
                NormConfig::new(channels),
            ),
        }
    }

    /// Builds a LayerNorm from existing parameters.
    pub fn layer_norm(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.channels])?;
        checks::expect_shape("norm.bias", &bias, &[config.channels])?;
        Ok(Self::LayerNorm {
            weight,
            bias,
            config,
        })
    }

    /// Builds an RMSNorm from an existing scale parameter.
    pub fn rms_norm(weight: Tensor, config: NormConfig) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.channels])?;
        Ok(Self::RmsNorm { weight, config })
    }

    /// Which strategy this is.
    pub fn kind(&self) -> NormKind {
        match self {
            Self::Identity => NormKind::Identity,
            Self::LayerNorm { .. } => NormKind::LayerNorm,
            Self::RmsNorm { .. } => NormKind::RmsNorm,
        }
    }

    /// True for the pass-through strategy.
    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }

    /// Applies the strategy to a `(batch, tokens, channels)` sequence.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (center, weight, bias, config) = match self {
            Self::Identity => return Ok(hidden.clone()),
            Self::LayerNorm {
                weight,
                bias,
                config,
            } => (true, weight, Some(bias), config),
            Self::RmsNorm { weight, config } => (false, weight, None, config),
        };

        checks::expect_batch_tokens_channels("norm.input", hidden, config.channels)?;

        let channels = config.channels as f64;
        let mut compute = policy.cast_for_reduction(hidden)?;

        if center {
            let mean = (compute.sum_keepdim(D::Minus1)? / channels)?;
            compute = compute.broadcast_sub(&mean)?;
        }

        let variance = (compute.sqr()?.sum_keepdim(D::Minus1)? / channels)?;
        let denom = (variance + config.epsilon)?.sqrt()?;
        let mut normalized = compute.broadcast_div(&denom)?;

        let weight = weight.to_dtype(normalized.dtype())?;
        normalized = normalized.broadcast_mul(&weight)?;
        if let Some(bias) = bias {
            let bias = bias.to_dtype(normalized.dtype())?;
            normalized = normalized.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&normalized)
    }
}
