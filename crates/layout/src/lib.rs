//! Tensor-layout adapter for windowed 2-D attention.
//!
//! Feature maps follow the channel-first `(batch, channels, height, width)`
//! convention. Attention operates on flattened per-window sequences shaped
//! `(batch * num_windows, tokens_per_window, channels)`. This crate supplies
//! the permutations between the two layouts plus channel-first ↔ channel-last
//! conversion, and nothing else: every routine here is a pure rearrangement,
//! so `reassemble_windows(partition_windows(x, w)?, x.dims4()?, w)?` returns
//! `x` exactly, bit for bit.
//!
//! Divisibility of the spatial extents by the window extents is enforced
//! here, at the adapter boundary, rather than by the attention operators that
//! consume the windowed sequences.

pub mod channels;
pub mod window;

use candle_core::{Error, Result};

pub use channels::{channels_first, channels_last};
pub use window::{partition_windows, reassemble_windows};

/// Spatial extents of an attention window, fixed per module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window2d {
    /// Window extent along the height axis.
    pub height: usize,
    /// Window extent along the width axis.
    pub width: usize,
}

impl Window2d {
    /// Creates a rectangular window. Both extents must be non-zero.
    pub fn new(height: usize, width: usize) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(Error::Msg(format!(
                "window extents must be non-zero, got ({height}, {width})"
            )));
        }
        Ok(Self { height, width })
    }

    /// Creates a square window.
    pub fn square(size: usize) -> Result<Self> {
        Self::new(size, size)
    }

    /// Number of spatial positions covered by one window.
    pub fn tokens(&self) -> usize {
        self.height * self.width
    }
}

impl TryFrom<usize> for Window2d {
    type Error = Error;

    fn try_from(size: usize) -> Result<Self> {
        Self::square(size)
    }
}

impl TryFrom<(usize, usize)> for Window2d {
    type Error = Error;

    fn try_from((height, width): (usize, usize)) -> Result<Self> {
        Self::new(height, width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_tokens() -> Result<()> {
        assert_eq!(Window2d::new(4, 4)?.tokens(), 16);
        assert_eq!(Window2d::new(2, 3)?.tokens(), 6);
        assert_eq!(Window2d::square(1)?.tokens(), 1);
        Ok(())
    }

    #[test]
    fn zero_extent_rejected() {
        assert!(Window2d::new(0, 4).is_err());
        assert!(Window2d::new(4, 0).is_err());
    }

    #[test]
    fn conversions_build_windows() -> Result<()> {
        assert_eq!(Window2d::try_from(3)?, Window2d::square(3)?);
        assert_eq!(Window2d::try_from((2, 5))?, Window2d::new(2, 5)?);
        assert!(Window2d::try_from(0).is_err());
        Ok(())
    }
}
