//! Mixed-precision dtype policy.
//!
//! Projection weights may live in `f16`/`bf16` while the attention kernel
//! and normalization statistics want `f32`. A [`PrecisionPolicy`] names the
//! dtype for each phase of a layer: `storage` for parameters and outputs,
//! `compute` for matmuls and activations, `reduction` for softmax and norm
//! statistics. Layers cast on the way in and back on the way out, so a
//! reduced-precision model never accumulates in reduced precision.

use candle_core::{DType, Result, Tensor};

/// Dtypes used during the phases of a layer's forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    /// Dtype of parameters and layer outputs.
    pub storage: DType,
    /// Dtype for matmuls and activation evaluation.
    pub compute: DType,
    /// Dtype for reductions (softmax, norm statistics).
    pub reduction: DType,
}

impl PrecisionPolicy {
    /// Derives a policy from the dtype parameters are stored in:
    /// reduced-precision storage promotes to `f32` for compute and
    /// reductions, `f32`/`f64` storage computes in place.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self {
            storage,
            compute,
            reduction: DType::F32,
        }
    }

    /// Casts a tensor to the compute dtype ahead of a matmul.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype ahead of statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.reduction)
    }

    /// Casts a result back to the storage dtype.
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.storage)
    }

    /// Absolute tolerance appropriate for values round-tripped through the
    /// storage dtype. Test helper more than anything else.
    pub fn storage_tolerance(&self) -> f32 {
        match self.storage {
            DType::BF16 => 2e-2,
            DType::F16 => 5e-3,
            DType::F32 => 1e-5,
            DType::F64 => 1e-7,
            _ => 0.0,
        }
    }
}

fn cast(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
