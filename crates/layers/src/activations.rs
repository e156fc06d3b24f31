//! Activation catalogue.
//!
//! A small closed set of non-linearities, selected by tag at construction
//! time. Activations consume tensors of any shape and return tensors with
//! identical layout, promoting to the compute dtype requested by
//! [`PrecisionPolicy`] before evaluating and casting back afterwards.
//!
//! GELU uses the erf-based formula `0.5 * x * (1 + erf(x / sqrt(2)))`, the
//! variant the score-bias network was trained with.

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Identifies the non-linearity applied by a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Identity function, for wiring pass-through stacks.
    Identity,
    /// Erf-based GELU.
    Gelu,
    /// Standard ReLU.
    Relu,
}

impl ActivationKind {
    /// Applies the activation to `input` using the precision rules in `policy`.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match self {
            ActivationKind::Identity => policy.cast_to_storage(input),
            ActivationKind::Relu => {
                let compute = policy.cast_for_matmul(input)?;
                policy.cast_to_storage(&compute.relu()?)
            }
            ActivationKind::Gelu => {
                let compute = policy.cast_for_matmul(input)?;
                policy.cast_to_storage(&compute.gelu_erf()?)
            }
        }
    }
}
