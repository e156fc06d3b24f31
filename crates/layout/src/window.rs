//! Window partition and reassembly for channel-first feature maps.
//!
//! `partition_windows` splits a `(B, C, H, W)` map into non-overlapping
//! windows and flattens each window into a token sequence, producing
//! `(B * num_windows, window_h * window_w, C)`. `reassemble_windows` is its
//! exact inverse. Windows are ordered row-major over the window grid and
//! tokens row-major within each window, so an index round-trips unchanged.

use candle_core::{Error, Result, Tensor};

use crate::Window2d;

fn expect_divisible(extent: usize, window_extent: usize, axis: &str) -> Result<()> {
    if extent % window_extent != 0 {
        return Err(Error::Msg(format!(
            "feature map {axis} ({extent}) is not divisible by the window {axis} ({window_extent})"
        )));
    }
    Ok(())
}

/// Partitions a `(B, C, H, W)` feature map into flattened window sequences.
///
/// Returns `(B * num_windows, window.tokens(), C)`. Fails when the spatial
/// extents are not multiples of the window extents.
pub fn partition_windows(x: &Tensor, window: Window2d) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4().map_err(|_| {
        Error::Msg(format!(
            "partition_windows expects a (batch, channels, height, width) tensor, got {:?}",
            x.dims()
        ))
    })?;
    expect_divisible(h, window.height, "height")?;
    expect_divisible(w, window.width, "width")?;

    let grid_h = h / window.height;
    let grid_w = w / window.width;

    // (B, C, H, W) -> (B, H, W, C) -> window grid -> (B * nW, tokens, C)
    x.permute((0, 2, 3, 1))?
        .contiguous()?
        .reshape((b, grid_h, window.height, grid_w, window.width, c))?
        .permute((0, 1, 3, 2, 4, 5))?
        .contiguous()?
        .reshape((b * grid_h * grid_w, window.tokens(), c))
}

/// Inverse of [`partition_windows`].
///
/// `out_shape` is the `(B, C, H, W)` shape of the map being reassembled. The
/// channel count may differ from the partitioned input's (projections change
/// it); batch, spatial extents, and window geometry must agree.
pub fn reassemble_windows(
    seq: &Tensor,
    out_shape: (usize, usize, usize, usize),
    window: Window2d,
) -> Result<Tensor> {
    let (b, c, h, w) = out_shape;
    expect_divisible(h, window.height, "height")?;
    expect_divisible(w, window.width, "width")?;

    let grid_h = h / window.height;
    let grid_w = w / window.width;

    let (seq_batch, tokens, channels) = seq.dims3().map_err(|_| {
        Error::Msg(format!(
            "reassemble_windows expects a (windows, tokens, channels) tensor, got {:?}",
            seq.dims()
        ))
    })?;
    if seq_batch != b * grid_h * grid_w {
        return Err(Error::Msg(format!(
            "window count mismatch: sequence holds {seq_batch} windows, \
             ({b}, {c}, {h}, {w}) with {}x{} windows needs {}",
            window.height,
            window.width,
            b * grid_h * grid_w
        )));
    }
    if tokens != window.tokens() {
        return Err(Error::Msg(format!(
            "tokens per window mismatch: got {tokens}, window covers {}",
            window.tokens()
        )));
    }
    if channels != c {
        return Err(Error::Msg(format!(
            "channel mismatch: sequence carries {channels}, output shape expects {c}"
        )));
    }

    seq.reshape((b, grid_h, grid_w, window.height, window.width, c))?
        .permute((0, 1, 3, 2, 4, 5))?
        .contiguous()?
        .reshape((b, h, w, c))?
        .permute((0, 3, 1, 2))?
        .contiguous()
}
