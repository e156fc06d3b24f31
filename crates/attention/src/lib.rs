//! Windowed multi-head attention operators for 2-D feature maps.
//!
//! Building blocks for convolutional/transformer hybrid image models:
//!
//! * [`sdpa::scaled_dot_product_attention`]: the head-splitting attention
//!   kernel, with an explicit backend-selection policy (fused vs reference)
//!   threaded through [`core::SdpaConfig`].
//! * [`mha::Mha`] / [`mha::CrossMha`]: self- and cross-attention blocks
//!   over `(batch, tokens, channels)` sequences.
//! * [`window::WindowMha2d`] / [`window::WindowCrossMha2d`]: windowed
//!   wrappers over `(batch, channels, height, width)` maps; attention never
//!   crosses a window boundary.
//! * [`overlap::OverlapWindowMha2d`]: two half-window-shifted partitions
//!   attended and summed, widening the receptive field without quadratic
//!   cost.
//! * [`bias::WindowScoreBias`]: a learned relative-position bias that
//!   evaluates its network once per unique offset and gathers the full
//!   pairwise score matrix.
//!
//! Every operator is a pure function of its inputs plus immutable
//! per-instance buffers and trainable weights; all failures are synchronous
//! precondition violations.

pub mod bias;
pub mod core;
pub mod masks;
pub mod mha;
pub mod overlap;
pub mod sdpa;
pub mod window;

pub use crate::core::{AttentionError, BackendSelection, Kernel, SdpaConfig, MAX_FUSED_BATCH};
pub use bias::{WindowScoreBias, WindowScoreBiasConfig};
pub use mha::{CrossMha, Mha, MhaConfig};
pub use overlap::{OverlapWindowMha2d, OverlapWindowMha2dConfig};
pub use sdpa::scaled_dot_product_attention;
pub use window::{WindowCrossMha2d, WindowCrossMha2dConfig, WindowMha2d, WindowMha2dConfig};
