//! Pointwise (1×1) convolution over channel-first feature maps.
//!
//! A 1×1 convolution is the channel-first counterpart of a dense projection:
//! every spatial position is projected independently with shared weights.
//! The overlap-window attention variant uses it to produce its packed
//! query/key/value map and its output projection directly on `(B, C, H, W)`
//! tensors, before any window partitioning happens. Parameter handling
//! mirrors [`Linear`](crate::linear::Linear): shared storage, accessors, and
//! copy hooks for the external module initializer.

use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy, linear::LinearInit};

/// Configuration for a pointwise convolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointwiseConv2dConfig {
    /// Incoming channel count.
    pub in_channels: usize,
    /// Output channel count per projection shard.
    pub out_channels: usize,
    /// Whether a learnable per-channel bias is applied.
    pub bias: bool,
    /// Number of projections fused together along the channel axis.
    pub fused_projections: usize,
}

impl PointwiseConv2dConfig {
    /// Creates a configuration for a single 1×1 projection.
    pub fn new(in_channels: usize, out_channels: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            bias: true,
            fused_projections: 1,
        }
    }

    /// Total number of output channels produced by the layer.
    pub fn total_out_channels(&self) -> usize {
        self.out_channels * self.fused_projections
    }
}

/// 1×1 convolution with optional bias.
#[derive(Debug, Clone)]
pub struct PointwiseConv2d {
    config: PointwiseConv2dConfig,
    weight: Arc<Mutex<Tensor>>,
    bias: Option<Arc<Mutex<Tensor>>>,
}

impl PointwiseConv2d {
    /// Constructs the layer from pre-existing parameters.
    ///
    /// `weight` is `(out_channels, in_channels, 1, 1)`, `bias` is
    /// `(out_channels,)`.
    pub fn new(config: PointwiseConv2dConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight: Arc::new(Mutex::new(weight)),
            bias: bias.map(|b| Arc::new(Mutex::new(b))),
        })
    }

    /// Builds the layer with weights sampled from `init` and a zero bias.
    ///
    /// The sampler sees the `(out, in)` matrix shape; a 1×1 kernel has the
    /// same fan-in/fan-out as the equivalent dense projection.
    pub fn with_init(
        config: PointwiseConv2dConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let matrix = init.sample(
            (config.total_out_channels(), config.in_channels),
            device,
            dtype,
        )?;
        let weight = matrix.reshape((config.total_out_channels(), config.in_channels, 1, 1))?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.total_out_channels(), dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Returns the static configuration.
    pub fn config(&self) -> &PointwiseConv2dConfig {
        &self.config
    }

    /// Returns a clone of the `(out, in, 1, 1)` kernel tensor.
    pub fn weight(&self) -> Tensor {
        self.weight.lock().unwrap().clone()
    }

    /// Returns a clone of the bias tensor if present.
    pub fn bias(&self) -> Option<Tensor> {
        self.bias.as_ref().map(|bias| bias.lock().unwrap().clone())
    }

    /// Copies `value` into the kernel storage. Initializer hook.
    pub fn copy_weight_from(&mut self, value: &Tensor) -> Result<()> {
        Self::validate_weight(&self.config, value)?;
        let mut weight = self.weight.lock().unwrap();
        let cast = value.to_dtype(weight.dtype())?;
        *weight = cast;
        Ok(())
    }

    /// Copies `value` into the bias storage. Initializer hook.
    pub fn copy_bias_from(&mut self, value: &Tensor) -> Result<()> {
        match &self.bias {
            Some(existing) => {
                Self::validate_bias(&self.config, Some(value))?;
                let mut bias = existing.lock().unwrap();
                let cast = value.to_dtype(bias.dtype())?;
                *bias = cast;
                Ok(())
            }
            None => Err(Error::Msg("layer has no bias to copy into".into())),
        }
    }

    fn validate_weight(config: &PointwiseConv2dConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("pointwise_conv.weight", weight, 4)?;
        checks::expect_shape(
            "pointwise_conv.weight",
            weight,
            &[config.total_out_channels(), config.in_channels, 1, 1],
        )?;
        checks::expect_dtype_in(
            "pointwise_conv.weight",
            weight,
            &[DType::F16, DType::BF16, DType::F32],
        )?;
        checks::expect_contiguous("pointwise_conv.weight", weight)?;
        Ok(())
    }

    fn validate_bias(config: &PointwiseConv2dConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_rank("pointwise_conv.bias", tensor, 1)?;
                checks::expect_shape(
                    "pointwise_conv.bias",
                    tensor,
                    &[config.total_out_channels()],
                )?;
                Ok(())
            }
            (false, Some(_)) => Err(Error::Msg(
                "pointwise_conv.bias: supplied, but the config disables bias".into(),
            )),
            (true, None) => Err(Error::Msg(
                "pointwise_conv.bias: config requires a bias but none was supplied".into(),
            )),
            (false, None) => Ok(()),
        }
    }

    /// Applies the 1×1 convolution to a `(B, C, H, W)` map.
    pub fn forward(&self, x: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (_, channels, _, _) = x.dims4().map_err(|_| {
            Error::Msg(format!(
                "pointwise_conv.input: expected (batch, channels, height, width), got {:?}",
                x.dims()
            ))
        })?;
        if channels != self.config.in_channels {
            return Err(Error::Msg(format!(
                "pointwise_conv.input: expected {} channels, got {channels}",
                self.config.in_channels
            )));
        }

        let input = policy.cast_for_matmul(x)?.contiguous()?;
        let weight = {
            let guard = self.weight.lock().unwrap();
            policy.cast_for_matmul(&guard)?
        };
        let mut output = input.conv2d(&weight, 0, 1, 1, 1)?;

        if let Some(bias) = &self.bias {
            let bias = {
                let guard = bias.lock().unwrap();
                policy.cast_for_matmul(&guard)?
            };
            let bias = bias.reshape((1, self.config.total_out_channels(), 1, 1))?;
            output = output.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::{Linear, LinearConfig};
    use layout::{channels_first, channels_last};

    #[test]
    fn matches_equivalent_dense_projection() -> Result<()> {
        let device = Device::Cpu;
        let (b, c_in, c_out, h, w) = (2, 6, 10, 4, 3);

        let matrix = Tensor::randn(0f32, 0.1, (c_out, c_in), &device)?;
        let bias = Tensor::randn(0f32, 0.05, c_out, &device)?;

        let conv = PointwiseConv2d::new(
            PointwiseConv2dConfig::new(c_in, c_out),
            matrix.reshape((c_out, c_in, 1, 1))?,
            Some(bias.clone()),
        )?;
        let linear = Linear::new(LinearConfig::new(c_in, c_out), matrix, Some(bias))?;

        let x = Tensor::randn(0f32, 1.0, (b, c_in, h, w), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let via_conv = conv.forward(&x, &policy)?;
        assert_eq!(via_conv.dims(), &[b, c_out, h, w]);

        let seq = channels_last(&x)?.reshape((b, h * w, c_in))?;
        let via_linear = linear.forward(&seq, &policy)?;
        let via_linear = channels_first(&via_linear.reshape((b, h, w, c_out))?)?;

        let diff = via_conv
            .sub(&via_linear)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-5, "conv/linear divergence {diff}");
        Ok(())
    }

    #[test]
    fn channel_mismatch_rejected() -> Result<()> {
        let device = Device::Cpu;
        let conv = PointwiseConv2d::with_init(
            PointwiseConv2dConfig::new(4, 8),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let x = Tensor::zeros((1, 3, 2, 2), DType::F32, &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        assert!(conv.forward(&x, &policy).is_err());
        Ok(())
    }

    #[test]
    fn initializer_hook_replaces_kernel() -> Result<()> {
        let device = Device::Cpu;
        let mut conv = PointwiseConv2d::with_init(
            PointwiseConv2dConfig::new(2, 2),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let identity = Tensor::from_vec(vec![1f32, 0.0, 0.0, 1.0], (2, 2, 1, 1), &device)?;
        conv.copy_weight_from(&identity)?;

        let x = Tensor::randn(0f32, 1.0, (1, 2, 3, 3), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let out = conv.forward(&x, &policy)?;
        let diff = out.sub(&x)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
