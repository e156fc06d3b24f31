//! Dense projection layers.
//!
//! Linear layers expect inputs shaped `(batch, tokens, in_dim)`, or plain
//! `(rows, in_dim)` for host-built tables such as the relative-offset inputs
//! of the score-bias network, and return tensors with the same leading
//! dimensions and `out_dim` features. Multi-projection variants pack the
//! output as `(batch, tokens, num_projections * out_dim)` so callers can
//! split them for attention. Weights and activations are cast to
//! [`PrecisionPolicy::compute`] for matmuls and back to the storage dtype at
//! the end. Parameters sit behind shared storage and are exposed through
//! accessors and copy hooks so an external module initializer can overwrite
//! them after construction.

use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension per projection shard.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
    /// Number of projections fused together (1 for standard linear, 3 for a
    /// packed query/key/value map).
    pub fused_projections: usize,
}

impl LinearConfig {
    /// Creates a configuration for a single projection layer.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
            fused_projections: 1,
        }
    }

    /// Total number of output features produced by the layer.
    pub fn total_output_dim(&self) -> usize {
        self.output_dim * self.fused_projections
    }
}

/// Supported weight initialisation samplers for projections.
///
/// The initialization *policy*, which sampler a given model uses, belongs
/// to the external module initializer; these are the standard recipes it can
/// pick from, or it can bypass them entirely via the copy hooks.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Kaiming/He uniform initialisation.
    KaimingUniform { negative_slope: f64 },
    /// Kaiming/He normal initialisation.
    KaimingNormal { negative_slope: f64 },
    /// Scales another sampler, for deep-network stabilisation.
    Scaled { base: Box<LinearInit>, scale: f64 },
}

impl LinearInit {
    /// Convenience helper to scale an existing sampler.
    pub fn scaled(base: LinearInit, scale: f64) -> Self {
        Self::Scaled {
            base: Box::new(base),
            scale,
        }
    }

    /// Spread of the sampling distribution for a `(fan_out, fan_in)` matrix:
    /// the half-width for uniform samplers, the standard deviation for
    /// normal ones.
    fn spread(&self, fan_in: f64, fan_out: f64) -> f64 {
        let kaiming_gain =
            |slope: f64| (2.0f64 / (1.0 + slope * slope)).sqrt() / fan_in.sqrt();
        match self {
            LinearInit::XavierUniform => (6.0f64 / (fan_in + fan_out)).sqrt(),
            LinearInit::XavierNormal => (2.0f64 / (fan_in + fan_out)).sqrt(),
            LinearInit::KaimingUniform { negative_slope } => {
                3.0f64.sqrt() * kaiming_gain(*negative_slope)
            }
            LinearInit::KaimingNormal { negative_slope } => kaiming_gain(*negative_slope),
            LinearInit::Scaled { base, scale } => base.spread(fan_in, fan_out) * scale,
        }
    }

    fn is_uniform(&self) -> bool {
        match self {
            LinearInit::XavierUniform | LinearInit::KaimingUniform { .. } => true,
            LinearInit::XavierNormal | LinearInit::KaimingNormal { .. } => false,
            LinearInit::Scaled { base, .. } => base.is_uniform(),
        }
    }

    pub(crate) fn sample(
        &self,
        shape: (usize, usize),
        device: &Device,
        dtype: DType,
    ) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let spread = self.spread(in_dim as f64, out_dim as f64) as f32;
        let weight = if self.is_uniform() {
            Tensor::rand(-spread, spread, shape, device)?
        } else {
            Tensor::randn(0f32, spread, shape, device)?
        };
        if dtype == DType::F32 {
            Ok(weight)
        } else {
            weight.to_dtype(dtype)
        }
    }
}

/// Dense affine projection with optional bias and mixed-precision aware
/// forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Arc<Mutex<Tensor>>,
    bias: Option<Arc<Mutex<Tensor>>>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight: Arc::new(Mutex::new(weight)),
            bias: bias.map(|b| Arc::new(Mutex::new(b))),
        })
    }

    /// Builds a linear layer with weights sampled from `init` and a zero bias.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.total_output_dim(), config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.total_output_dim(), dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Returns the static configuration used to validate inputs.
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns a clone of the underlying weight tensor.
    pub fn weight(&self) -> Tensor {
        self.weight.lock().unwrap().clone()
    }

    /// Returns a clone of the bias tensor if present.
    pub fn bias(&self) -> Option<Tensor> {
        self.bias.as_ref().map(|bias| bias.lock().unwrap().clone())
    }

    /// Copies `value` into the weight storage. Initializer hook.
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

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.total_output_dim(), config.input_dim],
        )?;
        checks::expect_dtype_in(
            "linear.weight",
            weight,
            &[DType::F16, DType::BF16, DType::F32],
        )?;
        checks::expect_contiguous("linear.weight", weight)?;
        Ok(())
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_rank("linear.bias", tensor, 1)?;
                checks::expect_shape("linear.bias", tensor, &[config.total_output_dim()])?;
                checks::expect_dtype_in(
                    "linear.bias",
                    tensor,
                    &[DType::F16, DType::BF16, DType::F32],
                )?;
                Ok(())
            }
            (false, Some(_)) => Err(Error::Msg(
                "linear.bias: supplied, but the config disables bias".into(),
            )),
            (true, None) => Err(Error::Msg(
                "linear.bias: config requires a bias but none was supplied".into(),
            )),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims() {
            [batch, tokens, channels] => {
                if *channels != self.config.input_dim {
                    Err(Error::Msg(format!(
                        "linear.input: expected last dim {}, got {}",
                        self.config.input_dim, channels
                    )))
                } else if *batch == 0 || *tokens == 0 {
                    Err(Error::Msg(
                        "linear.input: batch/token dimensions must be non-zero".into(),
                    ))
                } else {
                    Ok(())
                }
            }
            [_, channels] => {
                if *channels != self.config.input_dim {
                    Err(Error::Msg(format!(
                        "linear.input: expected last dim {}, got {}",
                        self.config.input_dim, channels
                    )))
                } else {
                    Ok(())
                }
            }
            dims => Err(Error::Msg(format!(
                "linear.input: expected (batch, tokens, features) or (rows, features), got {dims:?}"
            ))),
        }
    }

    /// Applies the projection, promoting to the compute dtype when needed.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight = {
            let guard = self.weight.lock().unwrap();
            policy.cast_for_matmul(&guard)?
        };
        let weight_t = weight.t()?;

        let mut output = match input.dims() {
            [batch, tokens, _] => {
                let flat = input
                    .reshape((*batch * *tokens, self.config.input_dim))?
                    .contiguous()?;
                let proj = flat.matmul(&weight_t)?;
                proj.reshape((*batch, *tokens, self.config.total_output_dim()))?
            }
            [rows, _] => input.contiguous()?.matmul(&weight_t)?.reshape((
                *rows,
                self.config.total_output_dim(),
            ))?,
            _ => unreachable!("validated above"),
        };

        if let Some(bias) = &self.bias {
            let bias = {
                let guard = bias.lock().unwrap();
                policy.cast_for_matmul(&guard)?
            };
            output = output.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&output)
    }
}
