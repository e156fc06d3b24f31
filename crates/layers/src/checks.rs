//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be
//! wired into constructors or forward paths. They return
//! `candle_core::Result<()>` so call sites can propagate errors without
//! panicking. Each helper takes a `label` naming the tensor being checked so
//! failures point at the offending parameter rather than a bare shape.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor has the expected number of dimensions.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let actual = tensor.dims().len();
    if actual == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got {actual} ({:?})",
            tensor.dims()
        )))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Validates the `(batch, tokens, channels)` convention with a known channel count.
pub fn expect_batch_tokens_channels(label: &str, tensor: &Tensor, channels: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual] if *actual == channels => Ok(()),
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, tokens, {channels}) layout, got {dims:?}"
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.iter().any(|&candidate| candidate == dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Rejects tensors whose storage is not contiguous.
pub fn expect_contiguous(label: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!("{label}: tensor must be contiguous")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn rank_and_shape_checks() -> Result<()> {
        let t = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu)?;
        expect_rank("t", &t, 3)?;
        expect_shape("t", &t, &[2, 3, 4])?;
        assert!(expect_rank("t", &t, 2).is_err());
        assert!(expect_shape("t", &t, &[2, 3, 5]).is_err());
        Ok(())
    }

    #[test]
    fn sequence_layout_check() -> Result<()> {
        let t = Tensor::zeros((2, 9, 16), DType::F32, &Device::Cpu)?;
        expect_batch_tokens_channels("t", &t, 16)?;
        assert!(expect_batch_tokens_channels("t", &t, 8).is_err());
        Ok(())
    }

    #[test]
    fn dtype_check_names_offender() {
        let t = Tensor::zeros((1,), DType::U32, &Device::Cpu).unwrap();
        let err = expect_dtype_in("index", &t, &[DType::F32]).unwrap_err();
        assert!(err.to_string().contains("index"));
    }
}
