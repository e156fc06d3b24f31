//! Channel-first ↔ channel-last conversion.
//!
//! Attention and normalization want the channel axis last; convolutional
//! producers and consumers want it first. Both conversions return contiguous
//! tensors so downstream reshapes never observe permuted strides.

use candle_core::{Error, Result, Tensor};

/// Converts `(B, C, H, W)` to `(B, H, W, C)`.
pub fn channels_last(x: &Tensor) -> Result<Tensor> {
    if x.dims().len() != 4 {
        return Err(Error::Msg(format!(
            "channels_last expects a rank-4 tensor, got {:?}",
            x.dims()
        )));
    }
    x.permute((0, 2, 3, 1))?.contiguous()
}

/// Converts `(B, H, W, C)` to `(B, C, H, W)`.
pub fn channels_first(x: &Tensor) -> Result<Tensor> {
    if x.dims().len() != 4 {
        return Err(Error::Msg(format!(
            "channels_first expects a rank-4 tensor, got {:?}",
            x.dims()
        )));
    }
    x.permute((0, 3, 1, 2))?.contiguous()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn conversion_round_trips() -> Result<()> {
        let data: Vec<f32> = (0..2 * 3 * 4 * 5).map(|i| i as f32).collect();
        let x = Tensor::from_vec(data.clone(), (2, 3, 4, 5), &Device::Cpu)?;
        let nhwc = channels_last(&x)?;
        assert_eq!(nhwc.dims(), &[2, 4, 5, 3]);
        let back = channels_first(&nhwc)?;
        assert_eq!(back.dims(), &[2, 3, 4, 5]);
        assert_eq!(back.flatten_all()?.to_vec1::<f32>()?, data);
        Ok(())
    }

    #[test]
    fn rank_mismatch_rejected() -> Result<()> {
        let x = Tensor::zeros((2, 3, 4), candle_core::DType::F32, &Device::Cpu)?;
        assert!(channels_last(&x).is_err());
        assert!(channels_first(&x).is_err());
        Ok(())
    }
}
